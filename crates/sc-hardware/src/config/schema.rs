//! Sample-changer configuration schema.
//!
//! A configuration describes one changer: its driver kind, storage geometry,
//! timing, the names of the device channels/commands it uses and how
//! presence and the mounted sample are reported.
//!
//! # Example
//!
//! ```toml
//! name = "ISARA2"
//! driver = "isara2"
//! scan_on_load = true
//!
//! [geometry]
//! type = "pucks"
//! baskets = 29
//!
//! [timing]
//! ready_timeout = "3s"
//! action_timeout = "3m"
//!
//! [commands]
//! scan_basket = ""          # empty string: not available
//!
//! [state_map]
//! INIT = "moving"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sc_core::capabilities::{channels, commands};
use sc_core::model::Geometry;
use sc_core::state::{SampleChangerState, StateMap};

use super::profile;

// =============================================================================
// Driver kind
// =============================================================================

/// Family of robot the configuration targets.
///
/// Selects the default state table and telemetry layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// IRELEC ISARA2.
    Isara2,
    /// GROB with 0-based mounted numbers.
    Grob,
    /// EMBL MARVIN with a presence bitmask.
    Marvin,
    /// Plate manipulator working on crystal drops.
    PlateManipulator,
    #[default]
    /// Union of the known tables.
    Generic,
}

impl DriverKind {
    /// Configuration name of the driver.
    pub fn label(&self) -> &'static str {
        match self {
            DriverKind::Isara2 => "isara2",
            DriverKind::Grob => "grob",
            DriverKind::Marvin => "marvin",
            DriverKind::PlateManipulator => "plate_manipulator",
            DriverKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Timing
// =============================================================================

/// Deadlines and poll periods. Durations use humantime syntax (`"100ms"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Maximum wait for the device to become ready before dispatch.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Maximum wait for a dispatched action to complete.
    #[serde(with = "humantime_serde")]
    pub action_timeout: Duration,
    /// Pause after dispatch before the busy flag is trusted.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Busy/path-running poll period.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Resync loop tick.
    #[serde(with = "humantime_serde")]
    pub resync_interval: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(3),
            action_timeout: Duration::from_secs(180),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            resync_interval: Duration::from_secs(1),
        }
    }
}

impl TimingSettings {
    /// Millisecond-scale timing for simulations and tests.
    pub fn fast() -> Self {
        Self {
            ready_timeout: Duration::from_millis(200),
            action_timeout: Duration::from_millis(500),
            settle_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
            resync_interval: Duration::from_millis(20),
        }
    }
}

// =============================================================================
// Channel and command names
// =============================================================================

fn some(name: &str) -> Option<String> {
    Some(name.to_string())
}

/// Names of device channels. `None` or `""` means the device lacks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelNames {
    /// Raw status string.
    pub state: String,
    /// Arm power.
    pub powered: Option<String>,
    /// Trajectory in progress.
    pub path_running: Option<String>,
    /// Goniometer sample sensor.
    pub sample_detected: Option<String>,
    /// Basket presence list or bitmask.
    pub presence: Option<String>,
    /// Mounted basket number.
    pub mounted_puck: Option<String>,
    /// Mounted sample number.
    pub mounted_sample: Option<String>,
    /// Plate position under the beam.
    pub plate_location: Option<String>,
    /// Last sample barcode.
    pub barcode: Option<String>,
    /// Barcodes of the last scanned basket.
    pub basket_barcodes: Option<String>,
    /// Controller message.
    pub last_error: Option<String>,
    /// LN2 regulation.
    pub regulation: Option<String>,
    /// Lid 1 open.
    pub lid1: Option<String>,
    /// Lid 2 open.
    pub lid2: Option<String>,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            state: channels::STATE.to_string(),
            powered: some(channels::POWERED),
            path_running: some(channels::PATH_RUNNING),
            sample_detected: some(channels::SAMPLE_DETECTED),
            presence: some(channels::PRESENCE),
            mounted_puck: some(channels::MOUNTED_PUCK),
            mounted_sample: some(channels::MOUNTED_SAMPLE),
            plate_location: some(channels::PLATE_LOCATION),
            barcode: some(channels::BARCODE),
            basket_barcodes: some(channels::BASKET_BARCODES),
            last_error: some(channels::LAST_ERROR),
            regulation: some(channels::REGULATION),
            lid1: some(channels::LID1),
            lid2: some(channels::LID2),
        }
    }
}

/// Names of device commands. Optional commands set to `None` or `""` are
/// reported as unsupported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandNames {
    /// Mount a sample.
    pub load: String,
    /// Return the mounted sample.
    pub unload: String,
    /// Exchange in one trajectory.
    pub chained_load: Option<String>,
    /// Read one pin barcode.
    pub scan_sample: Option<String>,
    /// Read a whole basket.
    pub scan_basket: Option<String>,
    /// Stop the current trajectory.
    pub abort: Option<String>,
    /// Diffractometer phase for charging mode.
    pub set_phase: Option<String>,
    /// Arm power on.
    pub power_on: Option<String>,
    /// Arm power off.
    pub power_off: Option<String>,
    /// LN2 regulation on.
    pub regulation_on: Option<String>,
    /// LN2 regulation off.
    pub regulation_off: Option<String>,
    /// Open a lid.
    pub open_lid: Option<String>,
    /// Close a lid.
    pub close_lid: Option<String>,
    /// Dry trajectory.
    pub dry: Option<String>,
    /// Soak trajectory.
    pub soak: Option<String>,
    /// Tool back trajectory.
    pub back: Option<String>,
    /// Safe position trajectory.
    pub safe: Option<String>,
    /// Home trajectory.
    pub home: Option<String>,
    /// Controller reset.
    pub reset: Option<String>,
    /// Alarm acknowledgement.
    pub acknowledge: Option<String>,
}

impl Default for CommandNames {
    fn default() -> Self {
        Self {
            load: commands::LOAD.to_string(),
            unload: commands::UNLOAD.to_string(),
            chained_load: some(commands::CHAINED_LOAD),
            scan_sample: some(commands::SCAN_SAMPLE),
            scan_basket: some(commands::SCAN_BASKET),
            abort: some(commands::ABORT),
            set_phase: some(commands::SET_PHASE),
            power_on: some(commands::POWER_ON),
            power_off: some(commands::POWER_OFF),
            regulation_on: some(commands::REGULATION_ON),
            regulation_off: some(commands::REGULATION_OFF),
            open_lid: some(commands::OPEN_LID),
            close_lid: some(commands::CLOSE_LID),
            dry: some(commands::DRY),
            soak: some(commands::SOAK),
            back: some(commands::BACK),
            safe: some(commands::SAFE),
            home: some(commands::HOME),
            reset: some(commands::RESET),
            acknowledge: some(commands::ACKNOWLEDGE),
        }
    }
}

/// Treat an empty name as "not available".
pub fn available(name: &Option<String>) -> Option<&str> {
    name.as_deref().map(str::trim).filter(|n| !n.is_empty())
}

// =============================================================================
// Telemetry layout
// =============================================================================

/// How basket presence is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceSource {
    /// One boolean per basket, in dewar order.
    BoolList,
    /// Integer with bit `n - 1` set when basket `n` is present.
    ///
    /// With `mounted_puck_override`, the basket of the mounted sample counts
    /// as present even when its bit is clear.
    Bitmask {
        #[serde(default)]
        /// Count the mounted sample's basket as present.
        mounted_puck_override: bool,
    },
    /// No presence telemetry; holders keep their initial presence.
    Unavailable,
}

/// How the sample on the goniometer is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountedSource {
    /// Basket and sample numbers on two channels; negative means none.
    Indices {
        #[serde(default)]
        /// Numbers start at 0 instead of 1.
        zero_based: bool,
    },
    /// Plate `[row, col, x, y]`, 0-based row/col, `y` in `[0, 1)` across drops.
    PlateLocation,
    /// No mounted-sample telemetry; bookkeeping is local only.
    Unavailable,
}

/// How `load` replaces an already mounted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStrategy {
    /// One atomic exchange command taking both addresses.
    #[default]
    Chained,
    /// Unload then load, both under one executor slot.
    UnloadThenLoad,
    /// Plain load only; the device replaces the mounted sample itself.
    Direct,
}

// =============================================================================
// Top-level configuration
// =============================================================================

/// Complete configuration of one sample changer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangerConfig {
    /// Changer name, also the root address.
    pub name: String,
    #[serde(default)]
    /// Robot family.
    pub driver: DriverKind,
    /// Storage layout.
    pub geometry: Geometry,
    #[serde(default)]
    /// Deadlines and poll intervals.
    pub timing: TimingSettings,
    /// Extra raw-state entries, merged over the driver's table.
    #[serde(default)]
    pub state_map: BTreeMap<String, SampleChangerState>,
    #[serde(default)]
    /// Device channel names.
    pub channels: ChannelNames,
    #[serde(default)]
    /// Device command names.
    pub commands: CommandNames,
    /// Defaults to the driver's layout.
    #[serde(default)]
    pub presence: Option<PresenceSource>,
    /// Defaults to the driver's layout.
    #[serde(default)]
    pub mounted: Option<MountedSource>,
    /// Defaults to the driver's strategy.
    #[serde(default)]
    pub exchange: Option<ExchangeStrategy>,
    /// Refresh the barcode of a freshly loaded sample.
    #[serde(default)]
    pub scan_on_load: bool,
}

impl ChangerConfig {
    /// Configuration with default channels, commands and timing.
    pub fn new(name: impl Into<String>, driver: DriverKind, geometry: Geometry) -> Self {
        Self {
            name: name.into(),
            driver,
            geometry,
            timing: TimingSettings::default(),
            state_map: BTreeMap::new(),
            channels: ChannelNames::default(),
            commands: CommandNames::default(),
            presence: None,
            mounted: None,
            exchange: None,
            scan_on_load: false,
        }
    }

    /// Replace the timing settings.
    pub fn with_timing(mut self, timing: TimingSettings) -> Self {
        self.timing = timing;
        self
    }

    /// Override the driver's exchange strategy.
    pub fn with_exchange(mut self, exchange: ExchangeStrategy) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Driver table with the configured overrides applied.
    pub fn state_map(&self) -> StateMap {
        let mut map = profile::state_table(self.driver);
        for (raw, state) in &self.state_map {
            map.insert(raw, *state);
        }
        map
    }

    /// Configured presence layout, else the driver's.
    pub fn presence_source(&self) -> PresenceSource {
        self.presence
            .unwrap_or_else(|| profile::default_presence(self.driver))
    }

    /// Configured mounted-sample layout, else the driver's.
    pub fn mounted_source(&self) -> MountedSource {
        self.mounted
            .unwrap_or_else(|| profile::default_mounted(self.driver))
    }

    /// Configured exchange strategy, else the driver's.
    pub fn exchange_strategy(&self) -> ExchangeStrategy {
        self.exchange
            .unwrap_or_else(|| profile::default_exchange(self.driver))
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if let Err(e) = self.geometry.validate() {
            errors.push(e);
        }

        let t = &self.timing;
        if t.poll_interval.is_zero() {
            errors.push("timing.poll_interval must be > 0".to_string());
        }
        if t.resync_interval.is_zero() {
            errors.push("timing.resync_interval must be > 0".to_string());
        }
        if t.ready_timeout < t.poll_interval {
            errors.push(format!(
                "timing.ready_timeout ({:?}) is shorter than poll_interval ({:?})",
                t.ready_timeout, t.poll_interval
            ));
        }
        if t.action_timeout < t.poll_interval {
            errors.push(format!(
                "timing.action_timeout ({:?}) is shorter than poll_interval ({:?})",
                t.action_timeout, t.poll_interval
            ));
        }

        if self.channels.state.trim().is_empty() {
            errors.push("channels.state must not be empty".to_string());
        }
        if self.commands.load.trim().is_empty() || self.commands.unload.trim().is_empty() {
            errors.push("commands.load and commands.unload must not be empty".to_string());
        }
        if self.exchange_strategy() == ExchangeStrategy::Chained
            && available(&self.commands.chained_load).is_none()
        {
            errors.push("chained exchange requires commands.chained_load".to_string());
        }

        let plate = self.geometry.is_plate();
        match self.mounted_source() {
            MountedSource::PlateLocation if !plate => {
                errors.push("mounted source plate_location requires a plate geometry".to_string())
            }
            MountedSource::Indices { .. } if plate => {
                errors.push("plate geometries report the mounted sample by plate_location".to_string())
            }
            _ => {}
        }
        if plate && self.presence_source() != PresenceSource::Unavailable {
            errors.push("plate geometries have no presence telemetry".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
