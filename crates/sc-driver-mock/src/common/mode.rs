//! Operational modes for the mock changer.
//!
//! - **Instant**: commands complete synchronously, no task handles
//! - **Realistic**: trajectories run in the background with robot-like timing
//! - **Chaos**: realistic timing plus random transport failures, unless an
//!   explicit error configuration is given

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Robot-like timing - for integration tests and the simulator
    Realistic,
    /// Realistic timing with random failures - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether commands run as background trajectories.
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

impl FromStr for MockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instant" => Ok(MockMode::Instant),
            "realistic" => Ok(MockMode::Realistic),
            "chaos" => Ok(MockMode::Chaos),
            other => Err(format!("unknown mock mode '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
    }

    #[test]
    fn test_parse() {
        assert_eq!("Realistic".parse::<MockMode>().unwrap(), MockMode::Realistic);
        assert_eq!(" chaos ".parse::<MockMode>().unwrap(), MockMode::Chaos);
        assert!("slow".parse::<MockMode>().is_err());
    }

    #[test]
    fn test_is_timed() {
        assert!(!MockMode::Instant.is_timed());
        assert!(MockMode::Realistic.is_timed());
        assert!(MockMode::Chaos.is_timed());
    }
}
