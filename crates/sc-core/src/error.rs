//! Error types for the sample-changer core.
//!
//! `ScError` is the single error type returned by every operation on the
//! entity model, the task executor and the load/unload protocol.
//!
//! ## Error Classes
//!
//! - **Misuse** (`NoSampleSelected`, `InvalidSelection`, `AlreadyLoaded`,
//!   `DeviceDisabled`, `NoSampleLoaded`, `UnknownComponent`, `Busy`):
//!   raised before any command reaches the device. They are returned to the
//!   caller unchanged and never retried.
//! - **Device faults** (`DeviceTimeout`, `Communication`, `ActionFailed`,
//!   `Aborted`): raised after an action was attempted. The physical state of
//!   the changer is unknown afterwards; the caller is expected to run a resync
//!   before trying again.
//! - **Setup** (`Configuration`, `Unsupported`).
//!
//! Transport-level faults are described with [`DriverError`], which the mock
//! driver and real transports raise and which converts into
//! [`ScError::Communication`].

use std::time::Duration;
use thiserror::Error;

use crate::state::TaskKind;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a transport/driver fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Link to the device lost or a read failed.
    Communication,
    /// Controller reported a fault.
    Hardware,
    /// Device did not answer in time.
    Timeout,
    /// Rejected argument or unknown channel.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Fault raised by a device transport.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Transport that raised the fault.
    pub driver_type: String,
    /// Fault category.
    pub kind: DriverErrorKind,
    /// Device message.
    pub message: String,
}

impl DriverError {
    /// Fault of `kind` raised by `driver_type`.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the sample-changer error type.
pub type ScResult<T> = std::result::Result<T, ScError>;

/// Primary error type for sample-changer operations.
#[derive(Error, Debug)]
pub enum ScError {
    /// The device did not become ready, or the action did not complete,
    /// before the deadline.
    ///
    /// `phase` is either `"ready"` or the command name that was waited on.
    #[error("Timeout after {timeout:?} waiting for {phase}")]
    DeviceTimeout {
        /// What was waited on.
        phase: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Arm power is off; no command was dispatched.
    #[error("Sample changer '{0}' arm power is not enabled; switch on arm power before transferring samples")]
    DeviceDisabled(String),

    /// The requested sample is already on the goniometer.
    #[error("The sample {0} is already loaded")]
    AlreadyLoaded(String),

    /// A load was requested without a concrete sample.
    #[error("No sample selected")]
    NoSampleSelected,

    /// An unload was requested while no sample is tracked on the goniometer.
    #[error("No sample is loaded")]
    NoSampleLoaded,

    /// A component of the wrong kind was passed to select/scan.
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    /// The address or id does not exist in the component tree.
    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    /// Another action is already in flight on this device.
    #[error("Sample changer busy: {in_flight} in progress")]
    Busy {
        /// Action owning the executor.
        in_flight: TaskKind,
    },

    /// Dispatching a command or reading a channel failed.
    #[error("Communication error on '{target}': {message}")]
    Communication {
        /// Channel or command that failed.
        target: String,
        /// Transport message.
        message: String,
    },

    /// The device reported a fault once the action completed.
    #[error("Command '{command}' failed: {message}")]
    ActionFailed {
        /// Command that ended in a fault.
        command: String,
        /// Device error message.
        message: String,
    },

    /// The action was aborted while it was being waited on.
    #[error("Command '{0}' was aborted")]
    Aborted(String),

    /// The operation is not available on this driver (command not configured).
    #[error("Operation not supported by this sample changer: {0}")]
    Unsupported(String),

    /// Invalid configuration values.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ScError {
    /// Wrap a transport failure for `target` (a command or channel name).
    pub fn communication(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ScError::Communication {
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Errors raised before any device I/O was attempted.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            ScError::DeviceDisabled(_)
                | ScError::AlreadyLoaded(_)
                | ScError::NoSampleSelected
                | ScError::NoSampleLoaded
                | ScError::InvalidSelection(_)
                | ScError::UnknownComponent(_)
                | ScError::Busy { .. }
        )
    }

    /// Errors raised after an action was attempted; the device state must be
    /// re-read before retrying.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            ScError::DeviceTimeout { .. }
                | ScError::Communication { .. }
                | ScError::ActionFailed { .. }
                | ScError::Aborted(_)
        )
    }
}

impl From<DriverError> for ScError {
    fn from(err: DriverError) -> Self {
        ScError::Communication {
            target: err.driver_type.clone(),
            message: format!("{} ({})", err.message, err.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_classification() {
        assert!(ScError::NoSampleSelected.is_misuse());
        assert!(ScError::AlreadyLoaded("1:01".into()).is_misuse());
        assert!(!ScError::NoSampleSelected.is_device_fault());

        let timeout = ScError::DeviceTimeout {
            phase: "load".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_device_fault());
        assert!(!timeout.is_misuse());
    }

    #[test]
    fn test_driver_error_converts_to_communication() {
        let err: ScError =
            DriverError::new("mock_isara", DriverErrorKind::Communication, "link down").into();
        match err {
            ScError::Communication { target, message } => {
                assert_eq!(target, "mock_isara");
                assert!(message.contains("link down"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ScError::AlreadyLoaded("3:07".into()).to_string(),
            "The sample 3:07 is already loaded"
        );
        assert_eq!(
            DriverErrorKind::InvalidParameter.to_string(),
            "invalid_parameter"
        );
    }
}
