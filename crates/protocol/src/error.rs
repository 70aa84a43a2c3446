//! Protocol error types

use crate::Command;
use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The device returned no bytes at all
    #[error("Empty response to {command}")]
    EmptyResponse { command: Command },

    /// First response byte does not echo the request opcode
    #[error("Invalid response prefix for {command}: expected {expected:#04x}, got {actual:#04x}")]
    InvalidPrefix {
        command: Command,
        expected: u8,
        actual: u8,
    },

    /// Response is shorter than the payload it should carry
    #[error("Short response to {command}: needed {needed} bytes, got {available}")]
    ShortResponse {
        command: Command,
        needed: usize,
        available: usize,
    },

    /// Wrong number of float parameters for the command template
    #[error("{command} takes {expected} parameters, got {actual}")]
    ParamCount {
        command: Command,
        expected: usize,
        actual: usize,
    },
}

impl ProtocolError {
    /// True for prefix failures: a desynchronized transport, a mismatched
    /// command/response pair or a device in an unexpected state.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::EmptyResponse { .. } | ProtocolError::InvalidPrefix { .. }
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidPrefix {
            command: Command::ReadVoltage,
            expected: b'U',
            actual: 0x83,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid response prefix"));
        assert!(msg.contains("read-voltage"));
        assert!(msg.contains("0x55"));
        assert!(msg.contains("0x83"));
    }

    #[test]
    fn test_validation_classification() {
        assert!(
            ProtocolError::EmptyResponse {
                command: Command::ReadSerial
            }
            .is_validation_failure()
        );
        assert!(
            !ProtocolError::ShortResponse {
                command: Command::ReadSerial,
                needed: 5,
                available: 2,
            }
            .is_validation_failure()
        );
    }
}
