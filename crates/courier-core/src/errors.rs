//! Error types for the Courier delivery pipeline
//!
//! This module contains the error taxonomy shared by every stage of the
//! pipeline: envelope construction and decoding, directory resolution,
//! transport failures, and execution-fabric rejection. `CourierError` unifies
//! them all.

use crate::envelope::EnvelopeKind;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures while turning wire data back into an envelope or typed value
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Wire message carries no payload field")]
    EmptyMessage,
    #[error("Binary payload is not a valid compressed stream: {reason}")]
    Compression { reason: String },
    #[error("Object blob is structurally invalid: {reason}")]
    MalformedObject { reason: String },
    #[error("Object of type {found} cannot be read as {expected}")]
    TypeMismatch { expected: String, found: String },
    #[error("Wire frame could not be decoded: {reason}")]
    Frame { reason: String },
}

/// Specific transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel to {address} could not be opened: {reason}")]
    OpenFailed { address: String, reason: String },
    #[error("Channel to {address} is not bound")]
    NotBound { address: String },
    #[error("Channel open timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Main error type for the Courier pipeline
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Directory unavailable: {reason}")]
    DirectoryUnavailable { reason: String },

    #[error("Delivery to {destination} exhausted after {attempts} attempts")]
    DeliveryExhausted { destination: String, attempts: u32 },

    #[error("Execution rejected: {reason}")]
    ExecutionRejected { reason: String },

    #[error("Backlog full (capacity: {capacity})")]
    BacklogFull { capacity: usize },

    #[error("{accessor} is not supported on a {kind} envelope")]
    Unsupported {
        accessor: &'static str,
        kind: EnvelopeKind,
    },

    #[error("No bound session is available for a response")]
    NoSession,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl From<bincode::Error> for CourierError {
    fn from(err: bincode::Error) -> Self {
        CourierError::Serialization {
            reason: err.to_string(),
        }
    }
}

impl CourierError {
    /// Create an invalid argument error with a reason
    pub fn invalid_argument<T: Into<String>>(reason: T) -> Self {
        CourierError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a directory unavailable error with a reason
    pub fn directory_unavailable<T: Into<String>>(reason: T) -> Self {
        CourierError::DirectoryUnavailable {
            reason: reason.into(),
        }
    }

    /// Create an execution rejected error with a reason
    pub fn execution_rejected<T: Into<String>>(reason: T) -> Self {
        CourierError::ExecutionRejected {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        CourierError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a delivery exhausted error for a destination
    pub fn delivery_exhausted<T: Into<String>>(destination: T, attempts: u32) -> Self {
        CourierError::DeliveryExhausted {
            destination: destination.into(),
            attempts,
        }
    }

    /// Create a channel open failure
    pub fn open_failed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        CourierError::Transport(TransportError::OpenFailed {
            address: address.into(),
            reason: reason.into(),
        })
    }

    /// Whether this error is surfaced to the immediate caller rather than
    /// recovered inside the pipeline
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            CourierError::InvalidArgument { .. }
                | CourierError::ExecutionRejected { .. }
                | CourierError::BacklogFull { .. }
                | CourierError::NoSession
        )
    }
}

/// Result type for Courier operations
pub type Result<T> = core::result::Result<T, CourierError>;

/// Alias used by downstream crates
pub type CourierResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CourierError::BacklogFull { capacity: 50 };
        assert_eq!(err.to_string(), "Backlog full (capacity: 50)");

        let err = CourierError::Unsupported {
            accessor: "object",
            kind: EnvelopeKind::Text,
        };
        assert_eq!(err.to_string(), "object is not supported on a Text envelope");
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: CourierError = DecodeError::EmptyMessage.into();
        assert!(matches!(err, CourierError::Decode(DecodeError::EmptyMessage)));
        assert!(!err.is_caller_facing());
    }

    #[test]
    fn test_caller_facing_errors() {
        assert!(CourierError::invalid_argument("empty source").is_caller_facing());
        assert!(CourierError::execution_rejected("shutting down").is_caller_facing());
        assert!(!CourierError::directory_unavailable("offline").is_caller_facing());
        assert!(!CourierError::delivery_exhausted("bob", 3).is_caller_facing());
    }
}
