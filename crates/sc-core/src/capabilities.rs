//! Device capability traits.
//!
//! A sample-changer controller talks to its device exclusively through these
//! traits:
//!
//! - [`Pollable`]: named channels that can be read, written and (optionally)
//!   subscribed to.
//! - [`Commandable`]: named commands that start robot actions.
//! - [`SignalEmitter`]: sink for the events the controller publishes.
//!
//! Transports (a control-system client, the in-process mock) implement
//! `Pollable + Commandable`, which makes them a [`ChangerDevice`].
//!
//! # Design
//!
//! Like the rest of the hardware capabilities in this workspace, each trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for transport errors
//!
//! Typed errors are produced one layer up, where the controller knows which
//! channel or command failed.
//!
//! # Example
//!
//! ```rust,ignore
//! let raw = device.read_channel("State").await?;
//! match device.execute_command("load", &[json!("2:03")]).await? {
//!     Some(task) => tracing::debug!(task, "action started"),
//!     None => tracing::debug!("action completed synchronously"),
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::events::ChangerEvent;

/// Handle returned by devices that execute commands asynchronously.
pub type TaskId = u64;

/// A value change pushed by a device channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    /// Channel name.
    pub channel: String,
    /// New value.
    pub value: Value,
}

impl ChannelUpdate {
    /// Update of `channel` to `value`.
    pub fn new(channel: impl Into<String>, value: Value) -> Self {
        Self {
            channel: channel.into(),
            value,
        }
    }
}

/// Capability: named telemetry channels.
///
/// # Contract
/// - `read_channel` returns the current value; unknown channels are errors
/// - `subscribe` returns `None` when the device cannot push updates, in which
///   case the controller relies on periodic polling alone
#[async_trait]
pub trait Pollable: Send + Sync {
    /// Read the current value of `channel`.
    async fn read_channel(&self, channel: &str) -> Result<Value>;

    /// Write `value` to `channel`.
    async fn write_channel(&self, channel: &str, value: Value) -> Result<()>;

    /// Stream of channel updates pushed by the device.
    fn subscribe(&self) -> Option<broadcast::Receiver<ChannelUpdate>> {
        None
    }
}

/// Capability: robot commands.
#[async_trait]
pub trait Commandable: Send + Sync {
    /// Dispatch `command` with `args`.
    ///
    /// # Returns
    /// - `Ok(Some(task))` if the device started an asynchronous action
    /// - `Ok(None)` if the command returned without a handle; completion has
    ///   to be detected by polling the busy state
    /// - `Err` if the command could not be dispatched
    async fn execute_command(&self, command: &str, args: &[Value]) -> Result<Option<TaskId>>;
}

/// Sink for controller events.
pub trait SignalEmitter: Send + Sync {
    fn emit(&self, event: ChangerEvent);
}

/// A complete sample-changer transport.
pub trait ChangerDevice: Pollable + Commandable {}

impl<T: Pollable + Commandable> ChangerDevice for T {}

/// Default channel names.
///
/// Configurations may rename any of them; the simulated robot exposes exactly
/// these.
pub mod channels {
    /// Raw controller status string.
    pub const STATE: &str = "State";
    /// Arm power.
    pub const POWERED: &str = "Powered";
    /// Robot trajectory in progress.
    pub const PATH_RUNNING: &str = "PathRunning";
    /// Goniometer sample sensor.
    pub const SAMPLE_DETECTED: &str = "SampleIsDetected";
    /// Per-basket presence, either a list of booleans or a bitmask.
    pub const PRESENCE: &str = "CassettePresence";
    /// Mounted basket number, negative when nothing is mounted.
    pub const MOUNTED_PUCK: &str = "NumPuckOnDiff";
    /// Mounted sample number, negative when nothing is mounted.
    pub const MOUNTED_SAMPLE: &str = "NumSampleOnDiff";
    /// `[row, col, x, y]` of the plate under the beam.
    pub const PLATE_LOCATION: &str = "PlateLocation";
    /// Barcode of the last scanned sample.
    pub const BARCODE: &str = "Barcode";
    /// Per-position barcodes of the last scanned basket.
    pub const BASKET_BARCODES: &str = "BasketBarcodes";
    /// Controller message, empty when clear.
    pub const LAST_ERROR: &str = "LastError";
    /// LN2 level regulation.
    pub const REGULATION: &str = "LN2Regulating";
    /// Dewar lid 1 open.
    pub const LID1: &str = "Lid1Open";
    /// Dewar lid 2 open.
    pub const LID2: &str = "Lid2Open";
}

/// Default command names.
pub mod commands {
    /// Mount a sample: `[address]`.
    pub const LOAD: &str = "load";
    /// Return the mounted sample: `[address]`.
    pub const UNLOAD: &str = "unload";
    /// Exchange in one trajectory: `[old, new]`.
    pub const CHAINED_LOAD: &str = "chainedLoad";
    /// Read one pin barcode: `[address]`.
    pub const SCAN_SAMPLE: &str = "scanSample";
    /// Read a whole basket: `[address]`.
    pub const SCAN_BASKET: &str = "scanBasket";
    /// Stop the current trajectory.
    pub const ABORT: &str = "abort";
    /// Diffractometer phase: `["Transfer" | "Centring"]`.
    pub const SET_PHASE: &str = "setPhase";
    /// Arm power on.
    pub const POWER_ON: &str = "powerOn";
    /// Arm power off.
    pub const POWER_OFF: &str = "powerOff";
    /// Start LN2 regulation.
    pub const REGULATION_ON: &str = "regulOn";
    /// Stop LN2 regulation.
    pub const REGULATION_OFF: &str = "regulOff";
    /// Open a dewar lid: `[lid]`.
    pub const OPEN_LID: &str = "openLid";
    /// Close a dewar lid: `[lid]`.
    pub const CLOSE_LID: &str = "closeLid";
    /// Dry the gripper.
    pub const DRY: &str = "dry";
    /// Cool the gripper in LN2.
    pub const SOAK: &str = "soak";
    /// Return the gripper tool.
    pub const BACK: &str = "back";
    /// Move to the safe position.
    pub const SAFE: &str = "safe";
    /// Move to the home position.
    pub const HOME: &str = "home";
    /// Reset the controller.
    pub const RESET: &str = "reset";
    /// Clear a latched alarm or fault.
    pub const ACKNOWLEDGE: &str = "clearAlarm";
}
