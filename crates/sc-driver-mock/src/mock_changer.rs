//! Mock sample changer implementation.
//!
//! [`MockSampleChanger`] simulates a dewar- or plate-based robot behind the
//! default channel and command names of `sc_core::capabilities`. It keeps its
//! own notion of what is mounted, which pucks are present and which barcodes
//! are stuck on the pins, so a controller can be driven end to end without
//! hardware.
//!
//! In [`MockMode::Instant`] every command completes before
//! `execute_command` returns and no task handle is given out. In the timed
//! modes transfers, scans and tool trajectories run as background tasks: the
//! path running flag is raised, a task handle returned, and the effect applied
//! when the trajectory ends. `abort` cancels the running trajectory without
//! applying its effect.
//!
//! Every state change is pushed to subscribers as a [`ChannelUpdate`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sc_core::capabilities::{channels, commands, ChannelUpdate, Commandable, Pollable, TaskId};
use sc_core::model::{ChangerModel, ComponentId, ComponentKind, Geometry};

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};

/// Driver type reported in injected errors.
pub const DRIVER_TYPE: &str = "mock_changer";

/// Random transport failure rate of [`MockMode::Chaos`] without an explicit
/// error configuration.
pub const CHAOS_FAILURE_RATE: f64 = 0.02;

const UPDATE_CAPACITY: usize = 256;

const CHANNELS: &[&str] = &[
    channels::STATE,
    channels::POWERED,
    channels::PATH_RUNNING,
    channels::SAMPLE_DETECTED,
    channels::PRESENCE,
    channels::MOUNTED_PUCK,
    channels::MOUNTED_SAMPLE,
    channels::PLATE_LOCATION,
    channels::BARCODE,
    channels::BASKET_BARCODES,
    channels::LAST_ERROR,
    channels::REGULATION,
    channels::LID1,
    channels::LID2,
];

// =============================================================================
// Profile
// =============================================================================

/// How presence flags are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEncoding {
    /// One boolean per basket
    List,
    /// Bit `i` set when basket `i + 1` is present
    Bitmask,
}

/// Raw-state vocabulary and telemetry encoding of the simulated robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockProfile {
    /// Raw state when idle
    pub ready: String,
    /// Raw state while a trajectory runs
    pub moving: String,
    /// Raw state after a failed command
    pub fault: String,
    /// Encoding of the presence channel
    pub presence: PresenceEncoding,
    /// Mounted basket/sample numbers start at 0
    pub zero_based: bool,
}

impl MockProfile {
    /// ISARA-like robot; matches the `isara2` and `generic` drivers.
    pub fn isara() -> Self {
        Self {
            ready: "ON".into(),
            moving: "RUNNING".into(),
            fault: "FAULT".into(),
            presence: PresenceEncoding::List,
            zero_based: false,
        }
    }

    /// GROB-like robot with 0-based mounted numbers
    pub fn grob() -> Self {
        Self {
            moving: "MOVING".into(),
            zero_based: true,
            ..Self::isara()
        }
    }

    /// MARVIN-like robot with a presence bitmask
    pub fn marvin() -> Self {
        Self {
            ready: "IDL".into(),
            moving: "BSY".into(),
            fault: "ALARM".into(),
            presence: PresenceEncoding::Bitmask,
            zero_based: false,
        }
    }

    /// Plate manipulator
    pub fn plate_manipulator() -> Self {
        Self {
            ready: "READY".into(),
            moving: "MOVING".into(),
            fault: "FAULT".into(),
            presence: PresenceEncoding::List,
            zero_based: false,
        }
    }
}

impl Default for MockProfile {
    fn default() -> Self {
        Self::isara()
    }
}

// =============================================================================
// State
// =============================================================================

/// A command received by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedCommand {
    /// Command name
    pub command: String,
    /// Arguments as sent
    pub args: Vec<Value>,
}

#[derive(Debug)]
struct MockState {
    raw: String,
    powered: bool,
    path_running: bool,
    /// Forced sensor reading; follows the mounted sample when `None`
    sensor_override: Option<bool>,
    presence: Vec<bool>,
    mounted: Option<ComponentId>,
    barcodes: HashMap<ComponentId, String>,
    barcode: String,
    basket_barcodes: Vec<String>,
    last_error: String,
    regulating: bool,
    lids: [bool; 2],
    phase: String,
    dispatched: Vec<DispatchedCommand>,
    trajectory: Option<JoinHandle<()>>,
    next_task: TaskId,
}

impl MockState {
    fn fault(&mut self, profile: &MockProfile, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "mock changer fault");
        self.raw = profile.fault.clone();
        self.last_error = message;
    }

    fn start_motion(&mut self, profile: &MockProfile) -> TaskId {
        self.path_running = true;
        self.raw = profile.moving.clone();
        self.next_task += 1;
        self.next_task
    }

    fn stop_motion(&mut self, profile: &MockProfile) {
        self.path_running = false;
        if self.raw == profile.moving {
            self.raw = profile.ready.clone();
        }
        if let Some(handle) = self.trajectory.take() {
            handle.abort();
        }
    }
}

type Effect = Box<dyn FnOnce(&Inner, &mut MockState) + Send>;

enum Action {
    Immediate(Effect),
    Trajectory { duration: Duration, effect: Effect },
}

impl Action {
    fn immediate(f: impl FnOnce(&Inner, &mut MockState) + Send + 'static) -> Self {
        Action::Immediate(Box::new(f))
    }

    fn trajectory(duration: Duration, f: impl FnOnce(&Inner, &mut MockState) + Send + 'static) -> Self {
        Action::Trajectory {
            duration,
            effect: Box::new(f),
        }
    }
}

struct Inner {
    name: String,
    model: ChangerModel,
    profile: MockProfile,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    state: Mutex<MockState>,
    updates: broadcast::Sender<ChannelUpdate>,
}

impl Inner {
    fn channel_value(&self, state: &MockState, channel: &str) -> Option<Value> {
        let value = match channel {
            channels::STATE => json!(state.raw),
            channels::POWERED => json!(state.powered),
            channels::PATH_RUNNING => json!(state.path_running),
            channels::SAMPLE_DETECTED => {
                json!(state.sensor_override.unwrap_or(state.mounted.is_some()))
            }
            channels::PRESENCE => match self.profile.presence {
                PresenceEncoding::List => json!(state.presence),
                PresenceEncoding::Bitmask => {
                    let mask = state
                        .presence
                        .iter()
                        .take(64)
                        .enumerate()
                        .filter(|(_, present)| **present)
                        .fold(0u64, |mask, (i, _)| mask | (1 << i));
                    json!(mask)
                }
            },
            channels::MOUNTED_PUCK => json!(self.mounted_numbers(state).0),
            channels::MOUNTED_SAMPLE => json!(self.mounted_numbers(state).1),
            channels::PLATE_LOCATION => self.plate_location(state),
            channels::BARCODE => json!(state.barcode),
            channels::BASKET_BARCODES => json!(state.basket_barcodes),
            channels::LAST_ERROR => json!(state.last_error),
            channels::REGULATION => json!(state.regulating),
            channels::LID1 => json!(state.lids[0]),
            channels::LID2 => json!(state.lids[1]),
            _ => return None,
        };
        Some(value)
    }

    /// Mounted `(basket, sample)` as the device numbers them; `-1` for none.
    fn mounted_numbers(&self, state: &MockState) -> (i64, i64) {
        let location = state
            .mounted
            .filter(|_| !self.model.geometry().is_plate())
            .and_then(|id| self.model.location_of(id));
        match location {
            Some((basket, sample)) => {
                let offset = i64::from(self.profile.zero_based);
                (basket as i64 - offset, sample as i64 - offset)
            }
            None => (-1, -1),
        }
    }

    /// `[row, col, x, y]` of the mounted crystal, rows and columns 0-based.
    fn plate_location(&self, state: &MockState) -> Value {
        let (Some(info), Some(id)) = (self.model.plate_info(), state.mounted) else {
            return Value::Null;
        };
        let Some((cell_no, drop_no)) = self.model.location_of(id) else {
            return Value::Null;
        };
        let cell = cell_no - 1;
        let y = (drop_no as f64 - 0.5) / info.drops as f64;
        json!([cell / info.cols, cell % info.cols, 0.5, y])
    }

    fn snapshot(&self, state: &MockState) -> Vec<Value> {
        CHANNELS
            .iter()
            .map(|channel| self.channel_value(state, channel).unwrap_or(Value::Null))
            .collect()
    }

    /// Apply `f` and push an update for every channel it changed.
    fn mutate<R>(&self, f: impl FnOnce(&Inner, &mut MockState) -> R) -> R {
        let mut state = self.state.lock();
        let before = self.snapshot(&state);
        let result = f(self, &mut state);
        let after = self.snapshot(&state);
        drop(state);

        for ((channel, old), new) in CHANNELS.iter().zip(before).zip(after) {
            if old != new {
                // No subscriber is not an error.
                let _ = self.updates.send(ChannelUpdate::new(*channel, new));
            }
        }
        result
    }

    fn holder_index(&self, sample: ComponentId) -> Option<usize> {
        let holder = self.model.holder_of(sample)?;
        self.model.holders().iter().position(|h| *h == holder)
    }

    fn holder_present(&self, state: &MockState, sample: ComponentId) -> bool {
        self.holder_index(sample)
            .and_then(|i| state.presence.get(i).copied())
            .unwrap_or(false)
    }

    fn resolve(&self, address: &str, kind: fn(ComponentKind) -> bool) -> Result<ComponentId> {
        self.model
            .by_address(address)
            .filter(|id| self.model.get(*id).is_some_and(|c| kind(c.kind)))
            .ok_or_else(|| anyhow!("no such position '{}'", address))
    }

    fn address(&self, id: ComponentId) -> &str {
        self.model.address(id)
    }

    // =========================================================================
    // Effects
    // =========================================================================

    /// Plate manipulators just move to the new crystal; dewar robots need an
    /// empty goniometer.
    fn mount(&self, state: &mut MockState, sample: ComponentId) {
        if state.mounted.is_some() && !self.model.geometry().is_plate() {
            state.fault(&self.profile, "goniometer occupied");
        } else if !self.holder_present(state, sample) {
            let message = format!("no sample at {}", self.address(sample));
            state.fault(&self.profile, message);
        } else {
            info!(changer = %self.name, address = self.address(sample), "sample mounted");
            state.barcode = self.read_barcode(state, sample);
            state.mounted = Some(sample);
        }
    }

    fn dismount(&self, state: &mut MockState) {
        match state.mounted.take() {
            Some(sample) => {
                info!(changer = %self.name, address = self.address(sample), "sample dismounted")
            }
            None => state.fault(&self.profile, "no sample mounted"),
        }
    }

    fn read_barcode(&self, state: &MockState, sample: ComponentId) -> String {
        if !self.holder_present(state, sample) {
            return String::new();
        }
        state.barcodes.get(&sample).cloned().unwrap_or_default()
    }
}

// =============================================================================
// MockSampleChanger
// =============================================================================

/// Simulated sample changer.
#[derive(Clone)]
pub struct MockSampleChanger {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MockSampleChanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MockSampleChanger")
            .field("name", &self.inner.name)
            .field("mode", &self.inner.mode)
            .field("raw", &state.raw)
            .field("mounted", &state.mounted.map(|id| self.inner.address(id)))
            .finish()
    }
}

impl MockSampleChanger {
    /// Powered-up changer with every basket present, in instant mode.
    pub fn new(geometry: Geometry) -> Result<Self> {
        Self::builder(geometry).build()
    }

    /// Create a builder for configuring the mock
    pub fn builder(geometry: Geometry) -> MockSampleChangerBuilder {
        MockSampleChangerBuilder::new(geometry)
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Timing mode
    pub fn mode(&self) -> MockMode {
        self.inner.mode
    }

    /// Raw-state vocabulary in use
    pub fn profile(&self) -> &MockProfile {
        &self.inner.profile
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Commands received so far, oldest first.
    pub fn dispatched(&self) -> Vec<DispatchedCommand> {
        self.inner.state.lock().dispatched.clone()
    }

    /// Names of the commands received so far.
    pub fn dispatched_names(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .dispatched
            .iter()
            .map(|d| d.command.clone())
            .collect()
    }

    /// Forget the commands received so far
    pub fn clear_dispatched(&self) {
        self.inner.state.lock().dispatched.clear();
    }

    /// Address of the sample on the goniometer.
    pub fn mounted(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state.mounted.map(|id| self.inner.address(id).to_string())
    }

    /// Current raw status string
    pub fn raw_state(&self) -> String {
        self.inner.state.lock().raw.clone()
    }

    /// Check if a trajectory is running
    pub fn path_running(&self) -> bool {
        self.inner.state.lock().path_running
    }

    /// Diffractometer phase last set
    pub fn phase(&self) -> String {
        self.inner.state.lock().phase.clone()
    }

    /// Check if arm power is on
    pub fn is_powered(&self) -> bool {
        self.inner.state.lock().powered
    }

    /// Check if LN2 regulation is on
    pub fn is_regulating(&self) -> bool {
        self.inner.state.lock().regulating
    }

    /// Lid `n` (1 or 2) open.
    pub fn lid_open(&self, lid: u8) -> bool {
        let state = self.inner.state.lock();
        match lid {
            1 | 2 => state.lids[usize::from(lid - 1)],
            _ => false,
        }
    }

    // =========================================================================
    // Out-of-band changes (operator, hardware)
    // =========================================================================

    /// Switch arm power out of band
    pub fn set_powered(&self, powered: bool) {
        self.inner.mutate(|_, s| s.powered = powered);
    }

    /// Force the raw status string.
    pub fn set_raw_state(&self, raw: &str) {
        self.inner.mutate(|_, s| s.raw = raw.to_string());
    }

    /// Enter the fault state with `message`, as a failed trajectory would.
    pub fn raise_fault(&self, message: &str) {
        self.inner.mutate(|inner, s| s.fault(&inner.profile, message));
    }

    /// Replace all presence flags; missing entries count as absent.
    pub fn set_presence(&self, presence: &[bool]) {
        let holders = self.inner.model.holders().len();
        self.inner.mutate(|_, s| {
            s.presence = (0..holders)
                .map(|i| presence.get(i).copied().unwrap_or(false))
                .collect();
        });
    }

    /// Put in or take out basket `basket_no` (1-based).
    pub fn set_basket_present(&self, basket_no: usize, present: bool) {
        self.inner.mutate(|_, s| {
            if let Some(flag) = basket_no.checked_sub(1).and_then(|i| s.presence.get_mut(i)) {
                *flag = present;
            }
        });
    }

    /// Force the goniometer sensor; `None` makes it follow the mounted sample.
    pub fn set_sample_detected(&self, detected: Option<bool>) {
        self.inner.mutate(|_, s| s.sensor_override = detected);
    }

    /// Mount or remove a sample by hand, bypassing the robot.
    pub fn set_mounted(&self, address: Option<&str>) -> Result<()> {
        let sample = address
            .map(|a| self.inner.resolve(a, |k: ComponentKind| k.is_sample()))
            .transpose()?;
        self.inner.mutate(|_, s| s.mounted = sample);
        Ok(())
    }

    /// Stick `barcode` on the sample at `address`.
    pub fn set_barcode(&self, address: &str, barcode: &str) -> Result<()> {
        let sample = self.inner.resolve(address, |k: ComponentKind| k.is_sample())?;
        self.inner
            .state
            .lock()
            .barcodes
            .insert(sample, barcode.to_string());
        Ok(())
    }

    /// Set the controller message out of band
    pub fn set_last_error(&self, message: &str) {
        self.inner.mutate(|_, s| s.last_error = message.to_string());
    }

    // =========================================================================
    // Command handling
    // =========================================================================

    async fn delay(&self) {
        if self.inner.mode.is_timed() {
            let delay = self.inner.timing.communication_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn plan(&self, command: &str, args: &[Value]) -> Result<Action> {
        let inner = &self.inner;
        let timing = inner.timing;
        let sample_arg = |i: usize| -> Result<ComponentId> {
            let address = string_arg(args, i)?;
            inner.resolve(address, |k: ComponentKind| k.is_sample())
        };

        let action = match command {
            commands::LOAD => {
                let sample = sample_arg(0)?;
                Action::trajectory(timing.transfer(), move |inner, s| inner.mount(s, sample))
            }
            commands::UNLOAD => Action::trajectory(timing.transfer(), |inner, s| inner.dismount(s)),
            commands::CHAINED_LOAD => {
                let sample = sample_arg(1)?;
                Action::trajectory(timing.transfer(), move |inner, s| {
                    inner.dismount(s);
                    inner.mount(s, sample);
                })
            }
            commands::SCAN_SAMPLE => {
                let sample = sample_arg(0)?;
                Action::trajectory(timing.scan(), move |inner, s| {
                    s.barcode = inner.read_barcode(s, sample);
                })
            }
            commands::SCAN_BASKET => {
                let address = string_arg(args, 0)?;
                let basket = inner.resolve(address, |k| k == ComponentKind::Basket)?;
                let samples = inner.model.descendant_samples(basket);
                let duration = timing.scan() * samples.len().max(1) as u32;
                Action::trajectory(duration, move |inner, s| {
                    s.basket_barcodes = samples.iter().map(|id| inner.read_barcode(s, *id)).collect();
                })
            }
            commands::ABORT => Action::immediate(|inner, s| {
                info!(changer = %inner.name, "trajectory aborted");
                s.stop_motion(&inner.profile);
            }),
            commands::SET_PHASE => {
                let phase = string_arg(args, 0)?.to_string();
                Action::immediate(move |_, s| s.phase = phase)
            }
            commands::POWER_ON => Action::immediate(|_, s| s.powered = true),
            commands::POWER_OFF => Action::immediate(|_, s| s.powered = false),
            commands::REGULATION_ON => Action::immediate(|_, s| s.regulating = true),
            commands::REGULATION_OFF => Action::immediate(|_, s| s.regulating = false),
            commands::OPEN_LID | commands::CLOSE_LID => {
                let lid = lid_arg(args)?;
                let open = command == commands::OPEN_LID;
                Action::trajectory(timing.maintenance(), move |_, s| s.lids[lid] = open)
            }
            commands::DRY | commands::SOAK | commands::BACK | commands::SAFE | commands::HOME => {
                Action::trajectory(timing.maintenance(), |_, _| {})
            }
            commands::RESET => Action::immediate(|inner, s| {
                s.stop_motion(&inner.profile);
                s.raw = inner.profile.ready.clone();
                s.last_error.clear();
            }),
            commands::ACKNOWLEDGE => Action::immediate(|inner, s| {
                if s.raw == inner.profile.fault {
                    s.raw = inner.profile.ready.clone();
                }
                s.last_error.clear();
            }),
            other => bail!("unknown command '{}'", other),
        };
        Ok(action)
    }

    fn start_trajectory(&self, command: &str, duration: Duration, effect: Effect) -> Result<Option<TaskId>> {
        let inner = &self.inner;
        if inner.state.lock().path_running {
            bail!("'{}' rejected: a trajectory is already running", command);
        }
        if !inner.state.lock().powered {
            inner.mutate(|inner, s| s.fault(&inner.profile, "arm power is off"));
            return Ok(None);
        }

        if inner.errors.stuck(command) {
            let task = inner.mutate(|inner, s| s.start_motion(&inner.profile));
            debug!(command, task, "trajectory started, path will not stop");
            return Ok(Some(task));
        }

        let failure = inner.errors.command_failure(command);
        let finish = move |inner: &Inner, s: &mut MockState| match failure {
            Some(message) => s.fault(&inner.profile, message),
            None => effect(inner, s),
        };

        if !inner.mode.is_timed() {
            inner.mutate(finish);
            return Ok(None);
        }

        let task = inner.mutate(|inner, s| s.start_motion(&inner.profile));
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            task_inner.mutate(|inner, s| {
                s.trajectory = None;
                s.path_running = false;
                s.raw = inner.profile.ready.clone();
                finish(inner, s);
            });
        });
        inner.state.lock().trajectory = Some(handle);
        debug!(command, task, ?duration, "trajectory started");
        Ok(Some(task))
    }
}

fn string_arg(args: &[Value], index: usize) -> Result<&str> {
    args.get(index)
        .and_then(Value::as_str)
        .with_context(|| format!("argument {} must be a position address", index + 1))
}

/// Zero-based lid index from a 1-based lid argument (default 1).
fn lid_arg(args: &[Value]) -> Result<usize> {
    let lid = match args.first() {
        None => 1,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| anyhow!("lid must be a number, got {}", value))?,
    };
    match lid {
        1 | 2 => Ok(lid as usize - 1),
        other => bail!("no lid {}", other),
    }
}

// =============================================================================
// Capability Implementations
// =============================================================================

#[async_trait]
impl Pollable for MockSampleChanger {
    async fn read_channel(&self, channel: &str) -> Result<Value> {
        self.delay().await;
        self.inner.errors.check_operation(DRIVER_TYPE, channel)?;
        let state = self.inner.state.lock();
        self.inner
            .channel_value(&state, channel)
            .ok_or_else(|| anyhow!("unknown channel '{}'", channel))
    }

    async fn write_channel(&self, channel: &str, value: Value) -> Result<()> {
        self.delay().await;
        self.inner.errors.check_operation(DRIVER_TYPE, channel)?;
        let flag = || {
            value
                .as_bool()
                .ok_or_else(|| anyhow!("'{}' expects a boolean, got {}", channel, value))
        };
        match channel {
            channels::POWERED => {
                let on = flag()?;
                self.inner.mutate(|_, s| s.powered = on);
            }
            channels::REGULATION => {
                let on = flag()?;
                self.inner.mutate(|_, s| s.regulating = on);
            }
            channels::LAST_ERROR => {
                let text = value.as_str().unwrap_or_default().to_string();
                self.inner.mutate(|_, s| s.last_error = text);
            }
            other if CHANNELS.contains(&other) => bail!("channel '{}' is read-only", other),
            other => bail!("unknown channel '{}'", other),
        }
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChannelUpdate>> {
        Some(self.inner.updates.subscribe())
    }
}

#[async_trait]
impl Commandable for MockSampleChanger {
    async fn execute_command(&self, command: &str, args: &[Value]) -> Result<Option<TaskId>> {
        self.delay().await;
        self.inner.errors.check_operation(DRIVER_TYPE, command)?;
        self.inner.state.lock().dispatched.push(DispatchedCommand {
            command: command.to_string(),
            args: args.to_vec(),
        });
        debug!(changer = %self.inner.name, command, ?args, "command received");

        match self.plan(command, args)? {
            Action::Immediate(effect) => {
                self.inner.mutate(effect);
                Ok(None)
            }
            Action::Trajectory { duration, effect } => self.start_trajectory(command, duration, effect),
        }
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`MockSampleChanger`] with fluent API
pub struct MockSampleChangerBuilder {
    geometry: Geometry,
    name: String,
    profile: MockProfile,
    mode: MockMode,
    timing: TimingConfig,
    error_config: Option<ErrorConfig>,
    presence: Option<Vec<bool>>,
    powered: bool,
    barcode_seed: Option<Option<u64>>,
}

impl MockSampleChangerBuilder {
    /// Create a new builder with defaults
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            name: "mock".to_string(),
            profile: MockProfile::default(),
            mode: MockMode::Instant,
            timing: TimingConfig::default(),
            error_config: None,
            presence: None,
            powered: true,
            barcode_seed: None,
        }
    }

    /// Set device name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set raw-state vocabulary
    pub fn profile(mut self, profile: MockProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set timing mode
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set trajectory durations
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Set error injection
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = Some(config);
        self
    }

    /// Initial presence flags (default: every basket present)
    pub fn presence(mut self, presence: Vec<bool>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Set initial arm power (default: on)
    pub fn powered(mut self, powered: bool) -> Self {
        self.powered = powered;
        self
    }

    /// Give every pin a random barcode; `seed` makes them reproducible.
    pub fn random_barcodes(mut self, seed: Option<u64>) -> Self {
        self.barcode_seed = Some(seed);
        self
    }

    /// Build the mock, failing on an invalid geometry
    pub fn build(self) -> Result<MockSampleChanger> {
        let model = ChangerModel::new(self.name.clone(), self.geometry)?;
        let holders = model.holders().len();
        let presence = match self.presence {
            Some(p) => (0..holders).map(|i| p.get(i).copied().unwrap_or(false)).collect(),
            None => vec![true; holders],
        };

        let mut barcodes = HashMap::new();
        if let Some(seed) = self.barcode_seed {
            let rng = MockRng::new(seed);
            for sample in model.samples().filter(|c| c.kind == ComponentKind::Pin) {
                barcodes.insert(sample.id, rng.barcode());
            }
        }

        let errors = self.error_config.unwrap_or_else(|| match self.mode {
            MockMode::Chaos => ErrorConfig::random_failures(CHAOS_FAILURE_RATE),
            MockMode::Instant | MockMode::Realistic => ErrorConfig::none(),
        });

        let state = MockState {
            raw: self.profile.ready.clone(),
            powered: self.powered,
            path_running: false,
            sensor_override: None,
            presence,
            mounted: None,
            barcodes,
            barcode: String::new(),
            basket_barcodes: Vec::new(),
            last_error: String::new(),
            regulating: true,
            lids: [false; 2],
            phase: String::new(),
            dispatched: Vec::new(),
            trajectory: None,
            next_task: 0,
        };
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        info!(changer = %self.name, mode = ?self.mode, holders, "mock sample changer created");
        Ok(MockSampleChanger {
            inner: Arc::new(Inner {
                name: self.name,
                model,
                profile: self.profile,
                mode: self.mode,
                timing: self.timing,
                errors,
                state: Mutex::new(state),
                updates,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_core::model::geometry::BasketType;

    fn pucks() -> MockSampleChanger {
        MockSampleChanger::new(Geometry::unipucks(3)).unwrap()
    }

    async fn read(mock: &MockSampleChanger, channel: &str) -> Value {
        mock.read_channel(channel).await.unwrap()
    }

    #[tokio::test]
    async fn test_initial_channels() {
        let mock = pucks();
        assert_eq!(read(&mock, channels::STATE).await, json!("ON"));
        assert_eq!(read(&mock, channels::POWERED).await, json!(true));
        assert_eq!(read(&mock, channels::PRESENCE).await, json!([true, true, true]));
        assert_eq!(read(&mock, channels::MOUNTED_PUCK).await, json!(-1));
        assert_eq!(read(&mock, channels::PLATE_LOCATION).await, Value::Null);
        assert_eq!(read(&mock, channels::SAMPLE_DETECTED).await, json!(false));
        assert!(mock.read_channel("Bogus").await.is_err());
    }

    #[tokio::test]
    async fn test_instant_load_and_unload() {
        let mock = pucks();
        let handle = mock.execute_command(commands::LOAD, &[json!("2:03")]).await.unwrap();
        assert_eq!(handle, None);
        assert_eq!(mock.mounted().as_deref(), Some("2:03"));
        assert_eq!(read(&mock, channels::MOUNTED_PUCK).await, json!(2));
        assert_eq!(read(&mock, channels::MOUNTED_SAMPLE).await, json!(3));
        assert_eq!(read(&mock, channels::SAMPLE_DETECTED).await, json!(true));

        mock.execute_command(commands::UNLOAD, &[json!("2:03")]).await.unwrap();
        assert_eq!(mock.mounted(), None);
        assert_eq!(mock.dispatched_names(), vec!["load", "unload"]);
    }

    #[tokio::test]
    async fn test_load_onto_occupied_goniometer_faults() {
        let mock = pucks();
        mock.set_mounted(Some("1:01")).unwrap();
        mock.execute_command(commands::LOAD, &[json!("2:03")]).await.unwrap();
        assert_eq!(mock.raw_state(), "FAULT");
        assert_eq!(read(&mock, channels::LAST_ERROR).await, json!("goniometer occupied"));
        assert_eq!(mock.mounted().as_deref(), Some("1:01"));

        mock.execute_command(commands::ACKNOWLEDGE, &[]).await.unwrap();
        assert_eq!(mock.raw_state(), "ON");
    }

    #[tokio::test]
    async fn test_load_from_absent_basket_faults() {
        let mock = pucks();
        mock.set_basket_present(2, false);
        mock.execute_command(commands::LOAD, &[json!("2:03")]).await.unwrap();
        assert_eq!(mock.raw_state(), "FAULT");
        assert_eq!(mock.mounted(), None);
    }

    #[tokio::test]
    async fn test_unknown_position_is_rejected() {
        let mock = pucks();
        assert!(mock.execute_command(commands::LOAD, &[json!("9:01")]).await.is_err());
        assert!(mock.execute_command(commands::LOAD, &[json!(3)]).await.is_err());
        assert!(mock.execute_command("teleport", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_chained_load_swaps() {
        let mock = pucks();
        mock.set_mounted(Some("1:01")).unwrap();
        mock.execute_command(commands::CHAINED_LOAD, &[json!("1:01"), json!("3:16")])
            .await
            .unwrap();
        assert_eq!(mock.mounted().as_deref(), Some("3:16"));
    }

    #[tokio::test]
    async fn test_zero_based_profile() {
        let mock = MockSampleChanger::builder(Geometry::unipucks(2))
            .profile(MockProfile::grob())
            .build()
            .unwrap();
        mock.set_mounted(Some("1:01")).unwrap();
        assert_eq!(read(&mock, channels::MOUNTED_PUCK).await, json!(0));
        assert_eq!(read(&mock, channels::MOUNTED_SAMPLE).await, json!(0));
    }

    #[tokio::test]
    async fn test_bitmask_presence() {
        let mock = MockSampleChanger::builder(Geometry::unipucks(4))
            .profile(MockProfile::marvin())
            .presence(vec![true, false, true])
            .build()
            .unwrap();
        assert_eq!(read(&mock, channels::PRESENCE).await, json!(0b0101));
        assert_eq!(read(&mock, channels::STATE).await, json!("IDL"));
    }

    #[tokio::test]
    async fn test_plate_location() {
        let mock = MockSampleChanger::builder(Geometry::Plate {
            rows: 8,
            cols: 12,
            drops: 3,
        })
        .profile(MockProfile::plate_manipulator())
        .build()
        .unwrap();
        mock.execute_command(commands::LOAD, &[json!("B3:2-1")]).await.unwrap();
        let location = read(&mock, channels::PLATE_LOCATION).await;
        assert_eq!(location[0], json!(1));
        assert_eq!(location[1], json!(2));
        assert!((location[3].as_f64().unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(read(&mock, channels::MOUNTED_PUCK).await, json!(-1));
    }

    #[tokio::test]
    async fn test_scans_read_barcodes() {
        let mock = MockSampleChanger::new(Geometry::Mixed {
            baskets: vec![BasketType::Spine, BasketType::Unipuck],
        })
        .unwrap();
        mock.set_barcode("2:05", "XYZ-5").unwrap();

        mock.execute_command(commands::SCAN_SAMPLE, &[json!("2:05")]).await.unwrap();
        assert_eq!(read(&mock, channels::BARCODE).await, json!("XYZ-5"));

        mock.execute_command(commands::SCAN_BASKET, &[json!("2")]).await.unwrap();
        let codes = read(&mock, channels::BASKET_BARCODES).await;
        assert_eq!(codes.as_array().unwrap().len(), 16);
        assert_eq!(codes[4], json!("XYZ-5"));
        assert_eq!(codes[0], json!(""));
    }

    #[tokio::test]
    async fn test_random_barcodes_are_reproducible() {
        let build = || {
            MockSampleChanger::builder(Geometry::unipucks(1))
                .random_barcodes(Some(3))
                .build()
                .unwrap()
        };
        let (a, b) = (build(), build());
        a.execute_command(commands::SCAN_SAMPLE, &[json!("1:07")]).await.unwrap();
        b.execute_command(commands::SCAN_SAMPLE, &[json!("1:07")]).await.unwrap();
        let code = read(&a, channels::BARCODE).await;
        assert!(code.as_str().unwrap().starts_with("SC"));
        assert_eq!(code, read(&b, channels::BARCODE).await);
    }

    #[tokio::test]
    async fn test_power_off_faults_trajectories() {
        let mock = pucks();
        mock.execute_command(commands::POWER_OFF, &[]).await.unwrap();
        assert!(!mock.is_powered());
        mock.execute_command(commands::LOAD, &[json!("1:01")]).await.unwrap();
        assert_eq!(mock.raw_state(), "FAULT");
        assert_eq!(mock.mounted(), None);
    }

    #[tokio::test]
    async fn test_lids_and_phase() {
        let mock = pucks();
        mock.execute_command(commands::OPEN_LID, &[json!(2)]).await.unwrap();
        assert!(mock.lid_open(2));
        assert!(!mock.lid_open(1));
        assert!(mock.execute_command(commands::OPEN_LID, &[json!(3)]).await.is_err());

        mock.execute_command(commands::SET_PHASE, &[json!("Transfer")]).await.unwrap();
        assert_eq!(mock.phase(), "Transfer");
    }

    #[tokio::test]
    async fn test_updates_are_pushed() {
        let mock = pucks();
        let mut rx = mock.subscribe().unwrap();
        mock.set_powered(false);
        let update = rx.recv().await.unwrap();
        assert_eq!(update, ChannelUpdate::new(channels::POWERED, json!(false)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_trajectory() {
        let mock = MockSampleChanger::builder(Geometry::unipucks(2))
            .mode(MockMode::Realistic)
            .timing(TimingConfig::quick())
            .build()
            .unwrap();
        let handle = mock.execute_command(commands::LOAD, &[json!("1:02")]).await.unwrap();
        assert!(handle.is_some());
        assert!(mock.path_running());
        assert_eq!(mock.raw_state(), "RUNNING");
        assert_eq!(mock.mounted(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!mock.path_running());
        assert_eq!(mock.raw_state(), "ON");
        assert_eq!(mock.mounted().as_deref(), Some("1:02"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_trajectory() {
        let mock = MockSampleChanger::builder(Geometry::unipucks(2))
            .mode(MockMode::Realistic)
            .timing(TimingConfig::quick())
            .build()
            .unwrap();
        mock.execute_command(commands::LOAD, &[json!("1:02")]).await.unwrap();
        assert!(mock
            .execute_command(commands::HOME, &[])
            .await
            .is_err());

        mock.execute_command(commands::ABORT, &[]).await.unwrap();
        assert!(!mock.path_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.mounted(), None);
        assert_eq!(mock.raw_state(), "ON");
    }
}
