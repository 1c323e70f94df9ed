//! Decoding of inbound client frames.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::command::{Command, CommandError};

/// A decoded client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Application-level ping; answered with a `pong` immediately.
    Ping,
    /// Answer to a server `ping`.
    Pong,
    Command(Command),
}

/// A frame that could not be turned into an [`InboundFrame`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("binary frames are not supported")]
    Binary,
    #[error("frame carries neither `cmd` nor a known `type`")]
    Unrecognized,
    /// The frame names a command but its envelope is unusable.
    #[error("invalid command frame: {0}")]
    InvalidCommand(CommandError),
}

/// Decode one text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(frame) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    classify(frame)
}

fn classify(frame: Map<String, Value>) -> Result<InboundFrame, ProtocolError> {
    if frame.contains_key("cmd") {
        return Command::from_object(frame)
            .map(InboundFrame::Command)
            .map_err(ProtocolError::InvalidCommand);
    }
    match frame.get("type").and_then(Value::as_str) {
        Some("ping") => Ok(InboundFrame::Ping),
        Some("pong") => Ok(InboundFrame::Pong),
        _ => Err(ProtocolError::Unrecognized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_frames_are_recognized() {
        assert_eq!(parse_frame(r#"{"type":"ping"}"#).unwrap(), InboundFrame::Ping);
        assert_eq!(
            parse_frame(r#"{"type":"pong","timestamp":"2024-01-01T00:00:00Z"}"#).unwrap(),
            InboundFrame::Pong
        );
    }

    #[test]
    fn command_frames_carry_params() {
        let frame = parse_frame(r#"{"cmd":"get_orders","params":{"symbol":"BTC-USDT"}}"#).unwrap();
        let InboundFrame::Command(command) = frame else {
            panic!("expected command");
        };
        assert_eq!(command.name, "get_orders");
        assert_eq!(
            command.params.str_opt(&["symbol"]).unwrap().as_deref(),
            Some("BTC-USDT")
        );
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            parse_frame("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(parse_frame("[1,2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(
            parse_frame(r#"{"type":"hello"}"#),
            Err(ProtocolError::Unrecognized)
        ));
        assert!(matches!(
            parse_frame(r#"{"cmd":""}"#),
            Err(ProtocolError::InvalidCommand(_))
        ));
    }
}
