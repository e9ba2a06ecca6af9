//! Maintenance operations: power, LN2 regulation, lids, tool trajectories and
//! recovery.
//!
//! | operation | execution |
//! |-----------|-----------|
//! | dry, soak, back, safe, home, open/close lid | task executor (state `Moving`) |
//! | power on/off, regulation on/off, acknowledge | immediate dispatch |
//! | reset | executor without readiness wait, then the tree is re-initialized |
//!
//! An operation whose command is not configured fails with `Unsupported`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use sc_core::capabilities::SignalEmitter;
use sc_core::error::{ScError, ScResult};
use sc_core::events::ChangerEvent;
use sc_core::model::Selection;
use sc_core::state::TaskKind;

use crate::changer::SampleChanger;
use crate::config::{available, CommandNames};

/// A maintenance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MaintenanceCommand {
    /// Switch arm power on.
    PowerOn,
    /// Switch arm power off.
    PowerOff,
    /// Start LN2 regulation.
    RegulationOn,
    /// Stop LN2 regulation.
    RegulationOff,
    /// Open a dewar lid.
    OpenLid {
        /// Lid number, 1-based.
        lid: u8,
    },
    /// Close a dewar lid.
    CloseLid {
        /// Lid number, 1-based.
        lid: u8,
    },
    /// Dry the gripper.
    Dry,
    /// Cool the gripper in LN2.
    Soak,
    /// Return the tool to its rest.
    Back,
    /// Move the arm to the safe position.
    Safe,
    /// Move the arm home.
    Home,
    /// Reset the controller and forget the tree contents.
    Reset,
    /// Clear an alarm or fault.
    Acknowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execution {
    Trajectory,
    Immediate,
    Recovery,
}

impl MaintenanceCommand {
    /// Name used on the command line and in logs.
    pub fn label(&self) -> String {
        match self {
            Self::PowerOn => "power_on".into(),
            Self::PowerOff => "power_off".into(),
            Self::RegulationOn => "regulation_on".into(),
            Self::RegulationOff => "regulation_off".into(),
            Self::OpenLid { lid } => format!("open_lid:{}", lid),
            Self::CloseLid { lid } => format!("close_lid:{}", lid),
            Self::Dry => "dry".into(),
            Self::Soak => "soak".into(),
            Self::Back => "back".into(),
            Self::Safe => "safe".into(),
            Self::Home => "home".into(),
            Self::Reset => "reset".into(),
            Self::Acknowledge => "acknowledge".into(),
        }
    }

    fn command<'a>(&self, names: &'a CommandNames) -> Option<&'a str> {
        let name = match self {
            Self::PowerOn => &names.power_on,
            Self::PowerOff => &names.power_off,
            Self::RegulationOn => &names.regulation_on,
            Self::RegulationOff => &names.regulation_off,
            Self::OpenLid { .. } => &names.open_lid,
            Self::CloseLid { .. } => &names.close_lid,
            Self::Dry => &names.dry,
            Self::Soak => &names.soak,
            Self::Back => &names.back,
            Self::Safe => &names.safe,
            Self::Home => &names.home,
            Self::Reset => &names.reset,
            Self::Acknowledge => &names.acknowledge,
        };
        available(name)
    }

    fn args(&self) -> Vec<Value> {
        match self {
            Self::OpenLid { lid } | Self::CloseLid { lid } => vec![json!(lid)],
            _ => Vec::new(),
        }
    }

    fn execution(&self) -> Execution {
        match self {
            Self::PowerOn
            | Self::PowerOff
            | Self::RegulationOn
            | Self::RegulationOff
            | Self::Acknowledge => Execution::Immediate,
            Self::Reset => Execution::Recovery,
            Self::OpenLid { .. }
            | Self::CloseLid { .. }
            | Self::Dry
            | Self::Soak
            | Self::Back
            | Self::Safe
            | Self::Home => Execution::Trajectory,
        }
    }
}

impl std::fmt::Display for MaintenanceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for MaintenanceCommand {
    type Err = ScError;

    /// Parse `"dry"`, `"power_on"`, `"open_lid:2"`...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s.as_str(), None),
        };
        let lid = || -> Result<u8, ScError> {
            arg.unwrap_or("1")
                .parse::<u8>()
                .ok()
                .filter(|l| (1..=2).contains(l))
                .ok_or_else(|| ScError::Unsupported(format!("lid '{}'", arg.unwrap_or(""))))
        };
        let op = match name {
            "power_on" => Self::PowerOn,
            "power_off" => Self::PowerOff,
            "regulation_on" => Self::RegulationOn,
            "regulation_off" => Self::RegulationOff,
            "open_lid" => Self::OpenLid { lid: lid()? },
            "close_lid" => Self::CloseLid { lid: lid()? },
            "dry" => Self::Dry,
            "soak" => Self::Soak,
            "back" => Self::Back,
            "safe" => Self::Safe,
            "home" => Self::Home,
            "reset" => Self::Reset,
            "acknowledge" => Self::Acknowledge,
            other => return Err(ScError::Unsupported(format!("maintenance '{}'", other))),
        };
        Ok(op)
    }
}

impl SampleChanger {
    /// Run a maintenance operation.
    pub async fn maintenance(&self, op: MaintenanceCommand) -> ScResult<()> {
        let command = op
            .command(self.io.commands())
            .ok_or_else(|| ScError::Unsupported(op.label()))?;
        let args = op.args();
        info!(changer = %self.config.name, %op, command, "maintenance");

        match op.execution() {
            Execution::Immediate => {
                self.io.dispatch(command, &args).await?;
                Ok(())
            }
            Execution::Trajectory => {
                let guard = self.executor.begin(TaskKind::Maintenance)?;
                self.publish_state();
                let result = guard.execute(command, &args).await;
                drop(guard);
                self.settle_state().await;
                result
            }
            Execution::Recovery => {
                let guard = self.executor.begin(TaskKind::Maintenance)?;
                let result = guard.execute_immediately(command, &args).await;
                drop(guard);
                if result.is_ok() {
                    self.reset_contents();
                }
                self.settle_state().await;
                result
            }
        }
    }

    /// Forget all presence, scan, selection and loaded info.
    pub fn reset_contents(&self) {
        let mut model = self.model.lock();
        let had_loaded = model.has_loaded_sample();
        let had_selection = model.selection() != Selection::default();
        model.reset_contents();
        drop(model);

        info!(changer = %self.config.name, "component tree reset");
        if had_loaded {
            self.events
                .emit(ChangerEvent::LoadedSampleChanged { address: None });
        }
        if had_selection {
            self.events.emit(ChangerEvent::SelectionChanged {
                basket: None,
                sample: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("dry".parse::<MaintenanceCommand>().unwrap(), MaintenanceCommand::Dry);
        assert_eq!(
            "open_lid:2".parse::<MaintenanceCommand>().unwrap(),
            MaintenanceCommand::OpenLid { lid: 2 }
        );
        assert_eq!(
            "CLOSE_LID".parse::<MaintenanceCommand>().unwrap(),
            MaintenanceCommand::CloseLid { lid: 1 }
        );
        assert!("open_lid:3".parse::<MaintenanceCommand>().is_err());
        assert!("fly".parse::<MaintenanceCommand>().is_err());
    }

    #[test]
    fn test_label_round_trip() {
        for op in [
            MaintenanceCommand::PowerOff,
            MaintenanceCommand::OpenLid { lid: 2 },
            MaintenanceCommand::Reset,
        ] {
            assert_eq!(op.label().parse::<MaintenanceCommand>().unwrap(), op);
        }
    }

    #[test]
    fn test_execution_classes() {
        assert_eq!(MaintenanceCommand::Soak.execution(), Execution::Trajectory);
        assert_eq!(MaintenanceCommand::PowerOn.execution(), Execution::Immediate);
        assert_eq!(MaintenanceCommand::Reset.execution(), Execution::Recovery);
    }

    #[test]
    fn test_unconfigured_command() {
        let mut names = CommandNames::default();
        names.dry = None;
        assert_eq!(MaintenanceCommand::Dry.command(&names), None);
        assert_eq!(MaintenanceCommand::Soak.command(&names), Some("soak"));
    }
}
