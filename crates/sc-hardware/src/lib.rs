//! `sc-hardware`
//!
//! Sample-changer controller on top of a device transport.
//!
//! - [`config`]: TOML/environment configuration and per-driver defaults
//! - [`device`]: typed channel reads and command dispatch
//! - [`executor`]: one action at a time, with readiness and completion waits
//! - [`changer`]: [`SampleChanger`], selection and the load/unload/scan protocol
//! - [`resync`]: reconciliation of the component tree with device telemetry
//! - [`maintenance`]: power, regulation, lids, tool trajectories and reset
//!
//! # Example
//!
//! ```rust,ignore
//! let config = sc_hardware::config::load_config(Path::new("isara2.toml"))?;
//! let changer = Arc::new(SampleChanger::new(config, device)?);
//! let resync = spawn_resync(Arc::clone(&changer));
//!
//! changer.load(Some("2:03".into())).await?;
//! resync.shutdown().await;
//! ```

pub mod changer;
pub mod config;
pub mod device;
pub mod executor;
pub mod maintenance;
pub mod resync;

pub use changer::SampleChanger;
pub use config::{ChangerConfig, DriverKind, ExchangeStrategy, TimingSettings};
pub use maintenance::MaintenanceCommand;
pub use resync::{spawn_resync, ResyncHandle, ResyncReport};
