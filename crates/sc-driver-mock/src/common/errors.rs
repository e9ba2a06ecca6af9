//! Error injection for the mock changer.
//!
//! Two families of faults:
//!
//! - **Transport faults** ([`ErrorConfig::check_operation`]): the read or
//!   command itself fails, as a lost connection would. The controller sees a
//!   `Communication` error.
//! - **Robot faults** ([`ErrorConfig::stuck`], [`ErrorConfig::command_failure`]):
//!   the command is accepted but the trajectory never ends, or ends with the
//!   device in its fault state.
//!
//! `CommunicationLoss` and `HardwareFault` latch on the first call: every
//! later operation fails the same way until [`ErrorConfig::reset`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sc_core::error::{DriverError, DriverErrorKind};

use super::rng::MockRng;

/// Rate key matching every operation.
const ANY_OPERATION: &str = "*";

/// Fault plan shared by all clones of one mock device.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    rates: Arc<HashMap<String, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    latch: Arc<Mutex<Latch>>,
}

/// Scripted fault.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Transport failure on every call of `operation` after the first `count`
    FailAfterN {
        /// Channel or command name.
        operation: String,
        /// Calls that still succeed.
        count: u32,
    },
    /// `command` starts a trajectory whose path never stops running
    StuckPath {
        /// Command name.
        command: String,
    },
    /// `command` ends with the device in its fault state, reporting `message`
    FailCommand {
        /// Command name.
        command: String,
        /// Message left on the error channel.
        message: String,
    },
    /// Link down from the first operation on
    CommunicationLoss,
    /// Controller fault `code` from the first operation on
    HardwareFault {
        /// Controller fault code.
        code: u32,
    },
}

/// Counters and latched faults.
#[derive(Default, Debug)]
struct Latch {
    calls: HashMap<String, u32>,
    fault: Option<(DriverErrorKind, String)>,
}

impl ErrorConfig {
    /// Healthy device.
    pub fn none() -> Self {
        Self::with(HashMap::new(), Vec::new(), None)
    }

    /// Every operation fails with probability `rate`.
    pub fn random_failures(rate: f64) -> Self {
        Self::random_failures_seeded(rate, None)
    }

    /// Like [`random_failures`](Self::random_failures), reproducible with `seed`.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self::with(HashMap::from([(ANY_OPERATION.to_string(), rate)]), Vec::new(), seed)
    }

    /// A single scripted fault.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scripted faults, checked in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::with(HashMap::new(), scenarios, None)
    }

    /// Failure probability per channel or command name; `"*"` is the fallback.
    pub fn with_rates(rates: HashMap<String, f64>) -> Self {
        Self::with(rates, Vec::new(), None)
    }

    fn with(rates: HashMap<String, f64>, scenarios: Vec<ErrorScenario>, seed: Option<u64>) -> Self {
        Self {
            rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            latch: Arc::new(Mutex::new(Latch::default())),
        }
    }

    /// Transport check for one channel read/write or command dispatch.
    pub fn check_operation(&self, driver_type: &str, operation: &str) -> Result<(), DriverError> {
        let fail = |kind: DriverErrorKind, message: String| Err(DriverError::new(driver_type, kind, message));
        let mut latch = self.latch.lock();

        if let Some((kind, message)) = &latch.fault {
            return fail(*kind, message.clone());
        }

        for scenario in self.scenarios.iter() {
            let latched = match scenario {
                ErrorScenario::CommunicationLoss => {
                    (DriverErrorKind::Communication, "Communication lost".to_string())
                }
                ErrorScenario::HardwareFault { code } => {
                    (DriverErrorKind::Hardware, format!("Hardware fault: {}", code))
                }
                ErrorScenario::FailAfterN { operation: op, count } if op == operation => {
                    let calls = latch.calls.entry(op.clone()).or_default();
                    *calls += 1;
                    if *calls > *count {
                        return fail(
                            DriverErrorKind::Communication,
                            format!("'{}' failed after {} calls", operation, count),
                        );
                    }
                    continue;
                }
                _ => continue,
            };
            latch.fault = Some(latched.clone());
            return fail(latched.0, latched.1);
        }
        drop(latch);

        let rate = self
            .rates
            .get(operation)
            .or_else(|| self.rates.get(ANY_OPERATION))
            .copied()
            .unwrap_or_default();
        if self.rng.chance(rate) {
            return fail(
                DriverErrorKind::Communication,
                format!("random failure on '{}'", operation),
            );
        }
        Ok(())
    }

    /// Whether `command` should leave the path running forever.
    pub fn stuck(&self, command: &str) -> bool {
        self.scenarios
            .iter()
            .any(|s| matches!(s, ErrorScenario::StuckPath { command: c } if c == command))
    }

    /// Fault message `command` should end with, if any.
    pub fn command_failure(&self, command: &str) -> Option<String> {
        self.scenarios.iter().find_map(|s| match s {
            ErrorScenario::FailCommand { command: c, message } if c == command => {
                Some(message.clone())
            }
            _ => None,
        })
    }

    /// Forget call counters and latched faults.
    pub fn reset(&self) {
        *self.latch.lock() = Latch::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRIVER: &str = "mock_changer";

    #[test]
    fn test_healthy_device() {
        let config = ErrorConfig::none();
        assert!((0..100).all(|_| config.check_operation(DRIVER, "State").is_ok()));
    }

    #[test]
    fn test_random_failures_are_seeded() {
        let run = || {
            let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
            (0..1000)
                .filter(|_| config.check_operation(DRIVER, "State").is_err())
                .count()
        };
        let failures = run();
        assert!((400..600).contains(&failures), "got {}", failures);
        assert_eq!(run(), failures);
    }

    #[test]
    fn test_per_operation_rates() {
        let config = ErrorConfig::with_rates(HashMap::from([("load".to_string(), 1.0)]));
        assert!(config.check_operation(DRIVER, "load").is_err());
        assert!(config.check_operation(DRIVER, "unload").is_ok());
    }

    #[test]
    fn test_load_fails_after_two_calls() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "load".into(),
            count: 2,
        });
        assert!(config.check_operation(DRIVER, "load").is_ok());
        assert!(config.check_operation(DRIVER, "State").is_ok());
        assert!(config.check_operation(DRIVER, "load").is_ok());
        let err = config.check_operation(DRIVER, "load").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);

        config.reset();
        assert!(config.check_operation(DRIVER, "load").is_ok());
    }

    #[test]
    fn test_link_loss_latches_until_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        assert!(config.check_operation(DRIVER, "State").is_err());
        assert!(config.check_operation(DRIVER, "Powered").is_err());

        // Shared by clones.
        let clone = config.clone();
        assert!(clone.check_operation(DRIVER, "load").is_err());
    }

    #[test]
    fn test_hardware_fault_code() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        let err = config.check_operation(DRIVER, "State").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(err.message.contains("66"));
    }

    #[test]
    fn test_robot_faults_pass_transport_checks() {
        let config = ErrorConfig::scenarios(vec![
            ErrorScenario::StuckPath {
                command: "load".into(),
            },
            ErrorScenario::FailCommand {
                command: "unload".into(),
                message: "gripper lost".into(),
            },
        ]);
        assert!(config.check_operation(DRIVER, "load").is_ok());
        assert!(config.stuck("load"));
        assert!(!config.stuck("unload"));
        assert_eq!(config.command_failure("unload").as_deref(), Some("gripper lost"));
        assert_eq!(config.command_failure("load"), None);
    }
}
