//! Inbound commands.
//!
//! ```json
//! {"panelIndex": 2, "desiredValue": true, "controlMode": "binary"}
//! {"panelIndex": 0, "desiredValue": 75, "controlMode": "variable"}
//! ```

use serde::Deserialize;
use thiserror::Error;

use crate::{
    config::ControlMode,
    modbus::{DesiredValue, WriteRequest},
};

pub const MALFORMED_COMMAND: &str = "malformed command";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCommand {
    pub panel_index: u16,
    pub desired_value: DesiredValue,
    pub control_mode: ControlMode,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("invalid command JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("command is for {requested} mode but panels are in {configured} mode")]
    ModeMismatch {
        configured: ControlMode,
        requested: ControlMode,
    },

    #[error("{mode} command carries a {given} value")]
    ValueKind {
        mode: ControlMode,
        given: &'static str,
    },
}

/// A command that failed validation, with whatever panel index could be salvaged for the status reply.
#[derive(Debug)]
pub struct Rejection {
    pub panel_index: Option<u16>,
    pub error: CommandError,
}

impl InboundCommand {
    pub fn into_request(self, configured: ControlMode) -> Result<WriteRequest, CommandError> {
        if self.control_mode != configured {
            return Err(CommandError::ModeMismatch {
                configured,
                requested: self.control_mode,
            });
        }

        match (self.control_mode, self.desired_value) {
            (ControlMode::Binary, DesiredValue::Switch(_))
            | (ControlMode::Variable, DesiredValue::Power(_)) => Ok(WriteRequest {
                panel_index: self.panel_index,
                desired_value: self.desired_value,
            }),
            (mode, value) => Err(CommandError::ValueKind {
                mode,
                given: value.kind(),
            }),
        }
    }
}

/// Validates a raw command payload against the configured control mode.
pub fn parse(bytes: &[u8], configured: ControlMode) -> Result<WriteRequest, Rejection> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|err| Rejection {
        panel_index: None,
        error: err.into(),
    })?;

    let panel_index = value
        .get("panelIndex")
        .and_then(serde_json::Value::as_u64)
        .and_then(|i| u16::try_from(i).ok());

    serde_json::from_value::<InboundCommand>(value)
        .map_err(CommandError::from)
        .and_then(|command| command.into_request(configured))
        .map_err(|error| Rejection { panel_index, error })
}
