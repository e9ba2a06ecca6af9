//! Mock sample-changer driver.
//!
//! This crate provides a simulated robot for testing the controller without
//! hardware, and backs the `sc-sim` binary. All delays use
//! `tokio::time::sleep`, so tests can run on a paused clock.
//!
//! # Modes
//!
//! - [`MockMode::Instant`]: commands complete synchronously (unit tests)
//! - [`MockMode::Realistic`]: trajectories take robot-like time, see
//!   [`TimingConfig::robot`]
//! - [`MockMode::Chaos`]: realistic timing plus random transport failures
//!
//! # Example
//!
//! ```rust,ignore
//! use sc_core::model::Geometry;
//! use sc_driver_mock::{MockMode, MockSampleChanger};
//!
//! let mock = MockSampleChanger::builder(Geometry::unipucks(29))
//!     .mode(MockMode::Realistic)
//!     .random_barcodes(Some(1))
//!     .build()?;
//! let device: Arc<dyn ChangerDevice> = Arc::new(mock.clone());
//! ```

pub mod common;
mod mock_changer;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};
pub use mock_changer::{
    DispatchedCommand, MockProfile, MockSampleChanger, MockSampleChangerBuilder, PresenceEncoding,
    CHAOS_FAILURE_RATE, DRIVER_TYPE,
};
