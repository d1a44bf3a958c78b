//! Remote command interpretation.
//!
//! Turning a [`Command`] into a [`Directive`] is pure; the agent applies
//! directives to the running pipeline and acknowledges afterwards.

use chrono::Utc;
use thiserror::Error;

use cryptosense_core::wire::{AckStatus, Command, CommandResponse, CommandType, ConfigUpdate};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Unknown command type: {0}")]
    Unknown(String),

    #[error("Malformed command {id}: {reason}")]
    Malformed { id: String, reason: String },
}

/// What the control loop should do in response to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Reconfigure(ConfigUpdate),
    Restart,
    Shutdown,
    StartCapture,
    StopCapture,
}

pub fn interpret(command: &Command) -> Result<Directive, CommandError> {
    match &command.kind {
        CommandType::UpdateConfig => command
            .config_update()
            .map(Directive::Reconfigure)
            .map_err(|e| CommandError::Malformed {
                id: command.id.clone(),
                reason: e.to_string(),
            }),
        CommandType::Restart => Ok(Directive::Restart),
        CommandType::Stop => Ok(Directive::Shutdown),
        CommandType::StartCapture => Ok(Directive::StartCapture),
        CommandType::StopCapture => Ok(Directive::StopCapture),
        CommandType::Unknown(kind) => Err(CommandError::Unknown(kind.clone())),
    }
}

/// Acknowledgement sent once local processing is done. Acks report
/// receipt, so one is built whatever the outcome.
pub fn ack(
    command: &Command,
    sensor_id: &str,
    status: AckStatus,
    message: impl Into<String>,
) -> CommandResponse {
    CommandResponse {
        command_id: command.id.clone(),
        sensor_id: sensor_id.to_string(),
        status,
        message: message.into(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_config_carries_the_update() {
        let update = ConfigUpdate {
            reporting_interval: Some(120),
            ..Default::default()
        };
        let cmd = Command::update_config(&update).unwrap();
        assert_eq!(interpret(&cmd).unwrap(), Directive::Reconfigure(update));
    }

    #[test]
    fn malformed_update_is_rejected() {
        let mut cmd = Command::new(CommandType::UpdateConfig);
        cmd.payload.insert("config".into(), json!({"reporting_interval": "soon"}));
        assert!(matches!(interpret(&cmd), Err(CommandError::Malformed { .. })));

        let empty = Command::new(CommandType::UpdateConfig);
        assert!(matches!(interpret(&empty), Err(CommandError::Malformed { .. })));
    }

    #[test]
    fn lifecycle_commands_map_to_directives() {
        let cases = [
            (CommandType::Restart, Directive::Restart),
            (CommandType::Stop, Directive::Shutdown),
            (CommandType::StartCapture, Directive::StartCapture),
            (CommandType::StopCapture, Directive::StopCapture),
        ];
        for (kind, expected) in cases {
            assert_eq!(interpret(&Command::new(kind)).unwrap(), expected);
        }
    }

    #[test]
    fn unknown_command_is_reported() {
        let cmd: Command = serde_json::from_value(json!({
            "id": "c-1",
            "type": "self_destruct",
            "requires_ack": true
        }))
        .unwrap();
        match interpret(&cmd) {
            Err(CommandError::Unknown(kind)) => assert_eq!(kind, "self_destruct"),
            other => panic!("unexpected: {other:?}"),
        }

        let response = ack(&cmd, "s-1", AckStatus::Ignored, "unknown command");
        assert_eq!(response.command_id, "c-1");
        assert_eq!(response.status, AckStatus::Ignored);
    }
}
