//! Error taxonomy shared by every layer of the node and gateway.
//!
//! Packet-level errors (`Checksum`, `Malformed`, `PayloadTooLarge`) are
//! local to one frame: callers log and drop them. `Transport` is only
//! produced after the bounded retry budget is spent. `SafetyViolation`
//! means the state machine refused to energise the pump.

use thiserror::Error;

/// Main error type for mesh and irrigation operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ===== Codec Errors =====
    /// Frame integrity check failed
    #[error("checksum mismatch: frame carries 0x{received:04X}, computed 0x{computed:04X}")]
    Checksum {
        /// Checksum carried by the frame
        received: u16,
        /// Checksum computed over the received bytes
        computed: u16,
    },

    /// Frame structure could not be parsed
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Payload exceeds the single-frame limit
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Link Errors =====
    /// Radio refused the frame on every attempt
    #[error("radio send failed after {attempts} attempt(s)")]
    Transport {
        /// Number of attempts made
        attempts: u32,
    },

    // ===== Control Errors =====
    /// Unknown, incomplete or currently disallowed command
    #[error("command rejected: {0}")]
    Command(String),

    /// Attempted actuation without an armed safety timeout
    #[error("safety violation: {0}")]
    SafetyViolation(String),

    /// Configuration values out of range
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Pump or valve driver reported a fault
    #[error("actuator fault: {0}")]
    Actuator(String),

    /// Controller task has stopped and no longer accepts requests
    #[error("irrigation controller is not running")]
    ControllerClosed,
}

impl Error {
    /// Errors that are confined to a single received frame.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            Error::Checksum { .. } | Error::Malformed(_) | Error::PayloadTooLarge { .. }
        )
    }

    /// Short code for logs and alert payloads
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Checksum { .. } => "CHECKSUM",
            Error::Malformed(_) => "MALFORMED",
            Error::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Error::Transport { .. } => "TRANSPORT",
            Error::Command(_) => "COMMAND",
            Error::SafetyViolation(_) => "SAFETY_VIOLATION",
            Error::Config(_) => "CONFIG",
            Error::Actuator(_) => "ACTUATOR",
            Error::ControllerClosed => "CONTROLLER_CLOSED",
        }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_errors_are_frame_local() {
        assert!(Error::Malformed("short".into()).is_packet_error());
        assert!(Error::Checksum {
            received: 1,
            computed: 2
        }
        .is_packet_error());
        assert!(!Error::Transport { attempts: 3 }.is_packet_error());
        assert!(!Error::SafetyViolation("x".into()).is_packet_error());
    }

    #[test]
    fn checksum_message_shows_both_values() {
        let err = Error::Checksum {
            received: 0x1234,
            computed: 0xBEEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x1234"), "{msg}");
        assert!(msg.contains("0xBEEF"), "{msg}");
    }

    #[test]
    fn error_codes() {
        assert_eq!(Error::Transport { attempts: 3 }.error_code(), "TRANSPORT");
        assert_eq!(Error::Config("bad".into()).error_code(), "CONFIG");
        assert_eq!(Error::ControllerClosed.error_code(), "CONTROLLER_CLOSED");
    }
}
