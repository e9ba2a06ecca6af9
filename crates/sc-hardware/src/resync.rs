//! Resync loop: reconcile the component tree with device telemetry.
//!
//! One [`SampleChanger::resync`] tick:
//!
//! 1. Reads the raw state (a failed read counts as `Unknown`), the path
//!    running flag and the goniometer sample sensor.
//! 2. Unless an action is in flight, reads basket presence and the reported
//!    mounted position.
//! 3. Applies the readings: flips presence that differs from the device and
//!    reconciles the loaded sample, old sample first. If an action started or
//!    finished while the tick was reading, everything read so far is stale
//!    and is dropped.
//! 4. Re-evaluates the state machine.
//! 5. Refreshes the telemetry signals (running, power, message, regulation,
//!    lids).
//!
//! Every step emits events only for values that actually changed, so an idle
//! device produces no events at all. Telemetry read failures never abort a
//! tick; they are logged and listed in the [`ResyncReport`].
//!
//! [`spawn_resync`] runs ticks on a fixed interval and whenever the device
//! pushes a channel update, until its [`ResyncHandle`] is shut down.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use sc_core::capabilities::{ChannelUpdate, SignalEmitter};
use sc_core::error::ScResult;
use sc_core::events::ChangerEvent;
use sc_core::model::address::pin_address;
use sc_core::model::ComponentId;
use sc_core::observable::Observable;
use sc_core::state::{SampleChangerState, StateInputs};

use crate::changer::SampleChanger;
use crate::config::{available, MountedSource, PresenceSource};

// =============================================================================
// Report
// =============================================================================

/// What one resync tick changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResyncReport {
    /// `(previous, current)` when the effective state changed.
    pub state: Option<(SampleChangerState, SampleChangerState)>,
    /// Holders whose presence flipped, with the new value.
    pub presence: Vec<(String, bool)>,
    /// `(previous, current)` loaded-sample addresses when reconciled.
    pub loaded: Option<(Option<String>, Option<String>)>,
    /// Telemetry signals emitted.
    pub telemetry: Vec<ChangerEvent>,
    /// Read failures swallowed during the tick.
    pub errors: Vec<String>,
}

impl ResyncReport {
    /// Whether anything was applied or emitted.
    pub fn has_changes(&self) -> bool {
        self.state.is_some()
            || !self.presence.is_empty()
            || self.loaded.is_some()
            || !self.telemetry.is_empty()
    }
}

// =============================================================================
// Telemetry signals
// =============================================================================

/// Last known value of each telemetry signal; `None` until first read.
#[derive(Debug)]
pub(crate) struct Telemetry {
    running: Observable<Option<bool>>,
    powered: Observable<Option<bool>>,
    message: Observable<Option<String>>,
    regulation: Observable<Option<bool>>,
    lid1: Observable<Option<bool>>,
    lid2: Observable<Option<bool>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            running: Observable::new("running", None),
            powered: Observable::new("powered", None),
            message: Observable::new("message", None),
            regulation: Observable::new("regulation", None),
            lid1: Observable::new("lid1", None),
            lid2: Observable::new("lid2", None),
        }
    }
}

impl Telemetry {
    fn events(
        running: Option<bool>,
        powered: Option<bool>,
        message: Option<String>,
        regulation: Option<bool>,
        lids: [Option<bool>; 2],
    ) -> Vec<ChangerEvent> {
        let mut out = Vec::new();
        if let Some(running) = running {
            out.push(ChangerEvent::RunningStateChanged { running });
        }
        if let Some(powered) = powered {
            out.push(ChangerEvent::PowerStateChanged { powered });
        }
        if let Some(message) = message {
            out.push(ChangerEvent::MessageChanged { message });
        }
        if let Some(regulating) = regulation {
            out.push(ChangerEvent::RegulationStateChanged { regulating });
        }
        for (i, open) in lids.into_iter().enumerate() {
            if let Some(open) = open {
                out.push(ChangerEvent::LidStateChanged {
                    lid: i as u8 + 1,
                    open,
                });
            }
        }
        out
    }
}

/// Value to publish when `observable` changed to a known value.
fn changed<T>(observable: &Observable<Option<T>>, value: Option<T>) -> Option<T>
where
    T: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static,
{
    let value = value?;
    observable.set_if_changed(Some(value.clone()))?;
    Some(value)
}

/// Drop number (1-based) for a plate location `y` in `[0, 1)`.
pub fn plate_drop(y: f64, drops: usize) -> usize {
    let drops = drops.max(1);
    if !y.is_finite() || y <= 0.0 {
        return 1;
    }
    ((y * drops as f64).floor() as usize + 1).min(drops)
}

/// Component-tree readings of one tick.
struct Contents {
    presence: Option<Vec<bool>>,
    mounted: Option<Option<ComponentId>>,
}

// =============================================================================
// Resync tick
// =============================================================================

impl SampleChanger {
    /// Run one reconciliation pass.
    pub async fn resync(&self) -> ResyncReport {
        let mut report = ResyncReport::default();
        let snapshot = self.executor.snapshot();
        let inputs = self.read_inputs(&mut report).await;

        let contents = if snapshot.in_flight.is_none() {
            Some(self.read_contents(&mut report).await)
        } else {
            trace!(changer = %self.config.name, "action in flight, model reconciliation skipped");
            None
        };

        let applied = self.executor.if_unchanged(snapshot.generation, || {
            *self.inputs.lock() = inputs;
            if let Some(contents) = contents {
                self.apply_presence(contents.presence, &mut report);
                self.apply_mounted(contents.mounted, &mut report);
            }
        });
        if applied.is_none() {
            debug!(changer = %self.config.name, "executor changed hands during resync, readings dropped");
        }
        report.state = self.publish_state();

        self.sync_telemetry(inputs.path_running, &mut report).await;

        if report.has_changes() {
            debug!(
                changer = %self.config.name,
                state = ?report.state,
                presence = report.presence.len(),
                loaded = ?report.loaded,
                telemetry = report.telemetry.len(),
                "resync applied changes"
            );
        }
        report
    }

    /// Refresh the state-machine readings and re-evaluate, without touching
    /// the component tree. Run after every action so the state does not rest
    /// on readings taken before the robot moved.
    pub(crate) async fn settle_state(&self) -> Option<(SampleChangerState, SampleChangerState)> {
        let mut report = ResyncReport::default();
        let inputs = self.read_inputs(&mut report).await;
        *self.inputs.lock() = inputs;
        self.publish_state()
    }

    /// Raw state, path running flag and goniometer sensor. A failed raw
    /// state read counts as `Unknown`.
    async fn read_inputs(&self, report: &mut ResyncReport) -> StateInputs {
        let raw = match self.io.raw_state().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(changer = %self.config.name, error = %e, "raw state read failed, state unknown");
                report.errors.push(e.to_string());
                None
            }
        };
        let path_running = self
            .note(self.io.path_running().await, report)
            .unwrap_or(false);
        let sample_detected = self
            .note(self.io.sample_detected().await, report)
            .flatten();
        StateInputs {
            raw,
            path_running,
            sample_detected,
            ..StateInputs::default()
        }
    }

    fn note<T>(&self, result: ScResult<T>, report: &mut ResyncReport) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(changer = %self.config.name, error = %e, "telemetry read failed");
                report.errors.push(e.to_string());
                None
            }
        }
    }

    /// Mounted `(basket, sample)` numbers, 1-based.
    async fn mounted_pin(&self, zero_based: bool) -> ScResult<Option<Option<(usize, usize)>>> {
        let Some((puck, sample)) = self.io.mounted_indices().await? else {
            return Ok(None);
        };
        let offset = i64::from(zero_based);
        let (puck, sample) = (puck + offset, sample + offset);
        if puck < 1 || sample < 1 {
            return Ok(Some(None));
        }
        Ok(Some(Some((puck as usize, sample as usize))))
    }

    async fn read_presence(&self, source: PresenceSource, holders: usize) -> ScResult<Option<Vec<bool>>> {
        match source {
            PresenceSource::Unavailable => Ok(None),
            PresenceSource::BoolList => self.io.presence_list().await,
            PresenceSource::Bitmask {
                mounted_puck_override,
            } => {
                let Some(mask) = self.io.presence_bitmask().await? else {
                    return Ok(None);
                };
                let mut flags: Vec<bool> = (0..holders)
                    .map(|i| i < 64 && mask & (1u64 << i) != 0)
                    .collect();
                // The mounted puck wins over its presence bit.
                if mounted_puck_override {
                    let zero_based = matches!(
                        self.config.mounted_source(),
                        MountedSource::Indices { zero_based: true }
                    );
                    if let Some(Some((puck, _))) = self.mounted_pin(zero_based).await? {
                        if let Some(flag) = flags.get_mut(puck - 1) {
                            *flag = true;
                        }
                    }
                }
                Ok(Some(flags))
            }
        }
    }

    /// Presence and mounted-sample readings, `None` where unavailable or
    /// unreadable.
    async fn read_contents(&self, report: &mut ResyncReport) -> Contents {
        let source = self.config.presence_source();
        let holders = self.model.lock().holders().len();
        let presence = match self.read_presence(source, holders).await {
            Ok(flags) => flags,
            Err(e) => {
                warn!(changer = %self.config.name, error = %e, "presence read failed");
                report.errors.push(e.to_string());
                None
            }
        };
        let mounted = match self.read_mounted().await {
            Ok(mounted) => mounted,
            Err(e) => {
                warn!(changer = %self.config.name, error = %e, "mounted sample read failed");
                report.errors.push(e.to_string());
                None
            }
        };
        Contents { presence, mounted }
    }

    fn apply_presence(&self, flags: Option<Vec<bool>>, report: &mut ResyncReport) {
        let Some(flags) = flags else {
            return;
        };
        let mut events = Vec::new();
        {
            let mut model = self.model.lock();
            let ids: Vec<ComponentId> = model.holders().to_vec();
            if flags.len() != ids.len() {
                debug!(
                    changer = %self.config.name,
                    reported = flags.len(),
                    holders = ids.len(),
                    "presence list length differs from geometry"
                );
            }
            for (holder, present) in ids.into_iter().zip(flags) {
                let cached = model.get(holder).is_some_and(|c| c.present);
                if cached == present {
                    continue;
                }
                if let Err(e) = model.set_presence(holder, present, None, false) {
                    warn!(changer = %self.config.name, error = %e, "presence update rejected");
                    continue;
                }
                let address = model.address(holder).to_string();
                report.presence.push((address.clone(), present));
                events.push(ChangerEvent::PresenceChanged { address, present });
            }
        }
        for event in events {
            self.events.emit(event);
        }
    }

    /// Sample the device reports on the goniometer; outer `None` when the
    /// device has no such telemetry.
    async fn read_mounted(&self) -> ScResult<Option<Option<ComponentId>>> {
        match self.config.mounted_source() {
            MountedSource::Unavailable => Ok(None),
            MountedSource::Indices { zero_based } => {
                let Some(pin) = self.mounted_pin(zero_based).await? else {
                    return Ok(None);
                };
                let model = self.model.lock();
                Ok(Some(pin.and_then(|(basket, sample)| {
                    let address = pin_address(basket, sample);
                    let id = model.by_address(&address);
                    if id.is_none() {
                        warn!(changer = %self.config.name, %address, "device reports a sample outside the geometry");
                    }
                    id
                })))
            }
            MountedSource::PlateLocation => {
                let Some(location) = self.io.plate_location().await? else {
                    return Ok(Some(None));
                };
                let [row, col, _x, y] = location;
                if row < 0.0 || col < 0.0 {
                    return Ok(Some(None));
                }
                let model = self.model.lock();
                let drops = model.plate_info().map_or(1, |p| p.drops);
                Ok(Some(model.plate_sample(
                    row as usize,
                    col as usize,
                    plate_drop(y, drops),
                )))
            }
        }
    }

    fn apply_mounted(&self, mounted: Option<Option<ComponentId>>, report: &mut ResyncReport) {
        let Some(mounted) = mounted else {
            return;
        };
        if self.model.lock().loaded_sample() == mounted {
            return;
        }
        match self.apply_loaded(mounted) {
            Ok(change) => report.loaded = change,
            Err(e) => {
                warn!(changer = %self.config.name, error = %e, "loaded sample reconciliation failed");
                report.errors.push(e.to_string());
            }
        }
    }

    async fn sync_telemetry(&self, path_running: bool, report: &mut ResyncReport) {
        let t = &self.telemetry;
        let channels = self.io.channels();
        let has_path = available(&channels.path_running).is_some();

        let powered = self.note(self.io.powered().await, report).flatten();
        let message = if available(&channels.last_error).is_some() {
            self.note(self.io.last_error().await, report)
                .map(Option::unwrap_or_default)
        } else {
            None
        };
        let regulation = self.note(self.io.regulation().await, report).flatten();
        let lid1 = self.note(self.io.lid_open(1).await, report).flatten();
        let lid2 = self.note(self.io.lid_open(2).await, report).flatten();

        let events = Telemetry::events(
            changed(&t.running, has_path.then_some(path_running)),
            changed(&t.powered, powered),
            changed(&t.message, message),
            changed(&t.regulation, regulation),
            [changed(&t.lid1, lid1), changed(&t.lid2, lid2)],
        );
        for event in &events {
            self.events.emit(event.clone());
        }
        report.telemetry = events;
    }

    /// Re-emit the current value of every known telemetry signal, e.g. for a
    /// freshly connected subscriber.
    pub fn replay_telemetry(&self) -> Vec<ChangerEvent> {
        let t = &self.telemetry;
        let events = Telemetry::events(
            t.running.get(),
            t.powered.get(),
            t.message.get(),
            t.regulation.get(),
            [t.lid1.get(), t.lid2.get()],
        );
        for event in &events {
            self.events.emit(event.clone());
        }
        events
    }
}

// =============================================================================
// Background loop
// =============================================================================

/// Running resync loop.
#[derive(Debug)]
pub struct ResyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ResyncHandle {
    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "resync loop ended abnormally");
        }
    }

    /// Whether the loop task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum Trigger {
    Channel(String),
    Lagged(u64),
    Closed,
}

async fn next_update(updates: &mut Option<broadcast::Receiver<ChannelUpdate>>) -> Trigger {
    let Some(rx) = updates.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(update) => Trigger::Channel(update.channel),
        Err(broadcast::error::RecvError::Lagged(n)) => Trigger::Lagged(n),
        Err(broadcast::error::RecvError::Closed) => {
            *updates = None;
            Trigger::Closed
        }
    }
}

/// Run resync ticks every `resync_interval` and on every device channel
/// update until the returned handle is shut down.
pub fn spawn_resync(changer: Arc<SampleChanger>) -> ResyncHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let interval = changer.config.timing.resync_interval;
    let mut updates = changer.io.subscribe();

    let task = tokio::spawn(async move {
        info!(changer = %changer.config.name, ?interval, "resync loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                trigger = next_update(&mut updates) => match trigger {
                    Trigger::Channel(channel) => trace!(%channel, "device update"),
                    Trigger::Lagged(n) => debug!(missed = n, "device updates lagged"),
                    Trigger::Closed => {
                        debug!("device update stream closed, polling only");
                        continue;
                    }
                },
            }
            changer.resync().await;
        }
        info!(changer = %changer.config.name, "resync loop stopped");
    });

    ResyncHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plate_drop() {
        assert_eq!(plate_drop(0.0, 3), 1);
        assert_eq!(plate_drop(0.34, 3), 2);
        assert_eq!(plate_drop(0.99, 3), 3);
        assert_eq!(plate_drop(1.5, 3), 3);
        assert_eq!(plate_drop(-0.2, 3), 1);
        assert_eq!(plate_drop(f64::NAN, 3), 1);
    }

    #[test]
    fn test_report_changes() {
        let mut report = ResyncReport::default();
        assert!(!report.has_changes());
        report.errors.push("read failed".into());
        assert!(!report.has_changes());
        report.presence.push(("1".into(), true));
        assert!(report.has_changes());
    }
}
