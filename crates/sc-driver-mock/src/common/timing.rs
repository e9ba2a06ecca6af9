//! Trajectory timing for realistic mode.

use std::time::Duration;

/// Durations of the simulated robot trajectories, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Load, unload and chained load
    pub transfer_ms: u64,
    /// Barcode scan of one sample
    pub scan_ms: u64,
    /// Tool trajectories (dry, soak, home...) and lid motion
    pub maintenance_ms: u64,
    /// Delay before a channel read or command is answered
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// Typical timing of a dewar-based robot.
    pub fn robot() -> Self {
        Self {
            transfer_ms: 2_000,
            scan_ms: 500,
            maintenance_ms: 1_000,
            communication_delay_ms: 2,
        }
    }

    /// Short trajectories for tests that need a background task.
    pub fn quick() -> Self {
        Self {
            transfer_ms: 50,
            scan_ms: 10,
            maintenance_ms: 20,
            communication_delay_ms: 0,
        }
    }

    /// Load, unload and exchange trajectories
    pub fn transfer(&self) -> Duration {
        Duration::from_millis(self.transfer_ms)
    }

    /// Barcode scan of one sample or basket
    pub fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }

    /// Tool trajectories
    pub fn maintenance(&self) -> Duration {
        Duration::from_millis(self.maintenance_ms)
    }

    /// Latency of every channel read and command
    pub fn communication_delay(&self) -> Duration {
        Duration::from_millis(self.communication_delay_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::robot()
    }
}
