//! Operator commands that can be queued for a running engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    /// Close every open lot and pause
    Liquidate,
    Reset,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Liquidate => "liquidate",
            ControlCommand::Reset => "reset",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(ControlCommand::Pause),
            "resume" => Ok(ControlCommand::Resume),
            "liquidate" => Ok(ControlCommand::Liquidate),
            "reset" => Ok(ControlCommand::Reset),
            other => Err(format!("unknown control command: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        for command in [
            ControlCommand::Pause,
            ControlCommand::Resume,
            ControlCommand::Liquidate,
            ControlCommand::Reset,
        ] {
            assert_eq!(command.as_str().parse::<ControlCommand>(), Ok(command));
        }
        assert!("halt".parse::<ControlCommand>().is_err());
    }
}
