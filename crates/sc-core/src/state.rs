//! Canonical sample-changer state machine.
//!
//! Raw device status strings are translated through a per-driver
//! [`StateMap`] and then combined with local knowledge (an action in flight,
//! charging mode, the goniometer sample sensor) by [`evaluate`].
//!
//! # Evaluation order
//!
//! 1. A failed raw read maps to `Unknown`; an unmapped string maps to `Unknown`.
//! 2. If the bookkeeping (`has_loaded_sample`) disagrees with the goniometer
//!    sample sensor, the result is `Unknown`. This rule wins over all others.
//! 3. An action in flight forces `Loading`/`Unloading` (load, unload) or
//!    `Moving` (scan, maintenance trajectories).
//! 4. A running robot path without a local action reports `Moving`.
//! 5. `Charging` is reported only while charging mode was opened explicitly
//!    and the raw state is not `Alarm`, `Fault` or `Moving`.
//! 6. Otherwise the mapped raw state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical state of a sample changer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleChangerState {
    #[default]
    /// Not yet read, unreadable, or contradicting the sample sensor.
    Unknown,
    /// Idle and able to accept an action.
    Ready,
    /// Idle with the arm parked.
    StandBy,
    /// Dewar open for manual exchange.
    Charging,
    /// Trajectory in progress.
    Moving,
    /// Mounting a sample.
    Loading,
    /// Returning a sample.
    Unloading,
    /// Alarm raised; needs acknowledgement.
    Alarm,
    /// Controller fault.
    Fault,
    /// Out of service.
    Disabled,
}

impl SampleChangerState {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Ready => "Ready",
            Self::StandBy => "StandBy",
            Self::Charging => "Charging",
            Self::Moving => "Moving",
            Self::Loading => "Loading",
            Self::Unloading => "Unloading",
            Self::Alarm => "Alarm",
            Self::Fault => "Fault",
            Self::Disabled => "Disabled",
        }
    }

    /// Whether the device is executing something.
    ///
    /// Everything except the steady states counts as busy; `Unknown` is busy
    /// because nothing can be assumed about the robot.
    pub fn is_busy(&self) -> bool {
        !matches!(
            self,
            Self::Ready | Self::Alarm | Self::Disabled | Self::Fault | Self::StandBy
        )
    }

    /// Whether a new action may be dispatched.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Charging | Self::StandBy)
    }

    /// Transient states driven by a local action.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Loading | Self::Unloading)
    }
}

impl std::fmt::Display for SampleChangerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Kind of action owned by the task executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Mount a sample, possibly exchanging the current one.
    Load,
    /// Return the mounted sample.
    Unload,
    /// Barcode scan of samples or baskets.
    Scan,
    /// Tool trajectory or controller reset.
    Maintenance,
}

impl TaskKind {
    /// State reported while this action is in flight.
    pub fn transient_state(&self) -> SampleChangerState {
        match self {
            TaskKind::Load => SampleChangerState::Loading,
            TaskKind::Unload => SampleChangerState::Unloading,
            TaskKind::Scan | TaskKind::Maintenance => SampleChangerState::Moving,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskKind::Load => "load",
            TaskKind::Unload => "unload",
            TaskKind::Scan => "scan",
            TaskKind::Maintenance => "maintenance",
        };
        f.write_str(label)
    }
}

/// Operation mode requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleChangerMode {
    #[default]
    /// Regular operation.
    Normal,
    /// Transfer/charging mode: the dewar or plate is accessible for manual
    /// exchange.
    Charging,
}

// =============================================================================
// Raw state lookup
// =============================================================================

/// Per-driver lookup table from raw status strings to canonical states.
///
/// Keys are matched case-insensitively after trimming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMap {
    entries: HashMap<String, SampleChangerState>,
}

impl StateMap {
    /// Empty table: every raw string maps to `Unknown`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(raw, state)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, SampleChangerState)>) -> Self {
        let mut map = Self::new();
        for (raw, state) in pairs {
            map.insert(raw, state);
        }
        map
    }

    /// Map `raw` to `state`, replacing an existing entry.
    pub fn insert(&mut self, raw: &str, state: SampleChangerState) {
        self.entries.insert(Self::normalize(raw), state);
    }

    /// Add every entry of `other`, replacing existing keys.
    pub fn extend(&mut self, other: &StateMap) {
        for (raw, state) in &other.entries {
            self.entries.insert(raw.clone(), *state);
        }
    }

    /// Translate a raw status string. Unmapped or missing strings give `Unknown`.
    pub fn map(&self, raw: Option<&str>) -> SampleChangerState {
        raw.and_then(|r| self.entries.get(&Self::normalize(r)).copied())
            .unwrap_or(SampleChangerState::Unknown)
    }

    /// Number of raw strings mapped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn normalize(raw: &str) -> String {
        raw.trim().to_uppercase()
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Everything the state machine looks at during one evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateInputs {
    /// Mapped raw state; `None` when reading the raw state failed.
    pub raw: Option<SampleChangerState>,
    /// Action currently owned by the task executor.
    pub in_flight: Option<TaskKind>,
    /// Robot path currently running.
    pub path_running: bool,
    /// Charging mode explicitly opened by the driver.
    pub charging: bool,
    /// Local bookkeeping says a sample is on the goniometer.
    pub has_loaded_sample: bool,
    /// Goniometer sample sensor, when the driver has one.
    pub sample_detected: Option<bool>,
}

/// Compute the effective state from raw telemetry and local knowledge.
pub fn evaluate(inputs: &StateInputs) -> SampleChangerState {
    use SampleChangerState as S;

    let raw = inputs.raw.unwrap_or(S::Unknown);

    if let Some(detected) = inputs.sample_detected {
        if detected != inputs.has_loaded_sample {
            return S::Unknown;
        }
    }

    if let Some(kind) = inputs.in_flight {
        return kind.transient_state();
    }

    if inputs.path_running {
        return S::Moving;
    }

    if inputs.charging && !matches!(raw, S::Alarm | S::Fault | S::Moving) {
        return S::Charging;
    }

    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use SampleChangerState as S;

    fn isara_map() -> StateMap {
        StateMap::from_pairs([
            ("ALARM", S::Alarm),
            ("ON", S::Ready),
            ("OFF", S::StandBy),
            ("FAULT", S::Fault),
            ("RUNNING", S::Moving),
        ])
    }

    #[test]
    fn test_map_is_case_insensitive() {
        let map = isara_map();
        assert_eq!(map.map(Some("on")), S::Ready);
        assert_eq!(map.map(Some(" Running ")), S::Moving);
        assert_eq!(map.map(Some("INIT")), S::Unknown);
        assert_eq!(map.map(None), S::Unknown);
    }

    #[test]
    fn test_raw_state_passes_through() {
        let inputs = StateInputs {
            raw: Some(S::Ready),
            ..Default::default()
        };
        assert_eq!(evaluate(&inputs), S::Ready);
    }

    #[test]
    fn test_failed_read_is_unknown() {
        assert_eq!(evaluate(&StateInputs::default()), S::Unknown);
    }

    #[test]
    fn test_in_flight_overrides_raw() {
        let inputs = StateInputs {
            raw: Some(S::Moving),
            in_flight: Some(TaskKind::Load),
            path_running: true,
            ..Default::default()
        };
        assert_eq!(evaluate(&inputs), S::Loading);

        let inputs = StateInputs {
            in_flight: Some(TaskKind::Unload),
            ..inputs
        };
        assert_eq!(evaluate(&inputs), S::Unloading);
    }

    #[test]
    fn test_sensor_mismatch_wins() {
        let inputs = StateInputs {
            raw: Some(S::Ready),
            in_flight: Some(TaskKind::Load),
            has_loaded_sample: false,
            sample_detected: Some(true),
            ..Default::default()
        };
        assert_eq!(evaluate(&inputs), S::Unknown);

        let agree = StateInputs {
            has_loaded_sample: true,
            ..inputs
        };
        assert_eq!(evaluate(&agree), S::Loading);
    }

    #[test]
    fn test_charging_requires_explicit_mode() {
        let mut inputs = StateInputs {
            raw: Some(S::Ready),
            ..Default::default()
        };
        assert_eq!(evaluate(&inputs), S::Ready);

        inputs.charging = true;
        assert_eq!(evaluate(&inputs), S::Charging);

        inputs.raw = Some(S::Alarm);
        assert_eq!(evaluate(&inputs), S::Alarm);
    }

    #[test]
    fn test_path_running_reports_moving() {
        let inputs = StateInputs {
            raw: Some(S::Ready),
            path_running: true,
            charging: true,
            ..Default::default()
        };
        assert_eq!(evaluate(&inputs), S::Moving);
    }

    #[test]
    fn test_busy_and_ready_sets() {
        assert!(S::Moving.is_busy());
        assert!(S::Unknown.is_busy());
        assert!(!S::Fault.is_busy());
        assert!(S::StandBy.is_ready());
        assert!(!S::Unknown.is_ready());
        assert!(!S::Alarm.is_ready());
    }
}
