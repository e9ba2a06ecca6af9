//! `sc-core`
//!
//! Core types and traits for controlling MX sample changers.
//!
//! A sample changer moves sample pins (or plate crystals) between a storage
//! dewar and the goniometer. This crate holds everything that does not touch
//! a device:
//!
//! - [`model`]: the component tree (dewar, baskets, pins, plate cells, drops,
//!   crystals) with selection, presence and loaded-sample bookkeeping
//! - [`state`]: canonical states and the evaluation rules that combine raw
//!   device status with local knowledge
//! - [`capabilities`]: the async traits a device transport implements
//! - [`events`]: events published to observers
//! - [`error`]: the [`ScError`] taxonomy shared by every crate
//!
//! The controller that drives a device through these traits lives in
//! `sc-hardware`.

pub mod capabilities;
pub mod error;
pub mod events;
pub mod model;
pub mod observable;
pub mod state;

pub use capabilities::{ChangerDevice, ChannelUpdate, Commandable, Pollable, SignalEmitter, TaskId};
pub use error::{DriverError, DriverErrorKind, ScError, ScResult};
pub use events::{ChangerEvent, EventBus};
pub use model::{ChangerModel, ComponentId, ComponentKind, Geometry, Selection, Target};
pub use observable::Observable;
pub use state::{evaluate, SampleChangerMode, SampleChangerState, StateInputs, StateMap, TaskKind};
