//! Simulation knobs shared by the mock robot: how fast trajectories run
//! ([`TimingConfig`]), whether they take time at all ([`MockMode`]), what
//! goes wrong ([`ErrorConfig`]) and the random source behind it ([`MockRng`]).

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
