//! Error types for emuscript-core

use crate::abi::AbiVersion;
use crate::session::{CallLocation, SessionId};
use crate::value::{NumericKind, VALID_TYPE_NAMES};
use std::fmt;
use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for emuscript-core
#[derive(Error, Debug)]
pub enum Error {
    /// Memory bridge and value-marshaling errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// A script API call failed
    #[error("API error: {0}")]
    Api(#[from] ApiCallError),

    /// Backend ABI violations (fatal at session construction)
    #[error("ABI violation: {0}")]
    Abi(#[from] AbiError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Pending-session queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialisation errors
    #[error("Logging error: {0}")]
    Log(#[from] crate::logging::LogError),
}

/// Data-validation and memory errors raised by the bridge.
///
/// Every variant is recoverable: it is handed back to the calling script as a
/// runtime error and never aborts the host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("attempt to {operation} at address {address:#010X} failed")]
    MemoryFault {
        operation: &'static str,
        address: u32,
    },

    #[error("undefined type \"{name}\"; valid types are {}", VALID_TYPE_NAMES.join(", "))]
    UnrecognizedType { name: String },

    #[error("width mismatch: operation needs {expected} bytes but {actual} are available")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("invalid size {0}; valid sizes are 1, 2, 4 and 8")]
    InvalidWidth(i64),

    #[error(
        "value {value} for address {address:#010X} is not representable as a byte \
         (must be between -128 and 255)"
    )]
    InvalidByteRange { address: u32, value: i64 },

    #[error("value {value} is out of range for {kind}")]
    ValueOutOfRange { kind: NumericKind, value: String },

    #[error("no null terminator within {limit} bytes of address {address:#010X}")]
    UnterminatedString { address: u32, limit: usize },

    #[error("request for {count} bytes exceeds the bulk limit of {limit}")]
    BulkLimit { count: usize, limit: usize },

    #[error("bad argument #{position}: expected {expected}, got {found}")]
    InvalidArgument {
        position: usize,
        expected: &'static str,
        found: String,
    },

    #[error("invalid controller port {0}; valid ports are 1 through 4")]
    InvalidPort(i64),

    #[error("probability {0} is outside of [0, 1]")]
    InvalidProbability(f64),

    #[error("unknown controller button \"{0}\"")]
    UnknownButton(String),

    #[error(
        "function was called with the dot operator; use the colon operator instead, \
         like this: '{example}'"
    )]
    Usage { example: &'static str },

    #[error("no function named \"{0}\"")]
    UnknownFunction(String),
}

impl BridgeError {
    /// Whether this error came from the memory collaborator rather than from
    /// malformed arguments.
    pub fn is_memory_fault(&self) -> bool {
        matches!(
            self,
            Self::MemoryFault { .. } | Self::UnterminatedString { .. }
        )
    }
}

/// A failed call into a script API surface, tagged with the offending function.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCallError {
    pub class: &'static str,
    pub function: String,
    pub usage: &'static str,
    pub error: BridgeError,
}

impl std::error::Error for ApiCallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl fmt::Display for ApiCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error in {}:{}(): {}", self.class, self.function, self.error)?;
        if !matches!(self.error, BridgeError::Usage { .. }) && !self.usage.is_empty() {
            write!(f, ". Example usage: '{}'", self.usage)?;
        }
        Ok(())
    }
}

/// Backend integration bugs detected while building a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbiError {
    #[error("session {id} ({filename}) was built without a backend ABI table")]
    MissingBackend { id: SessionId, filename: String },

    #[error("backend \"{language}\" implements ABI {found}, host requires {required}")]
    VersionMismatch {
        language: String,
        found: AbiVersion,
        required: AbiVersion,
    },
}

/// Session lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} is no longer active")]
    Inactive(SessionId),

    #[error("session {0} was already dequeued and cannot be queued again")]
    AlreadyDequeued(SessionId),

    #[error("script error in session {id} during {location}: {message}")]
    Script {
        id: SessionId,
        location: CallLocation,
        message: String,
    },
}

/// Pending-session queue errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("pending-session queue is closed")]
    Closed,

    #[error("timed out waiting for a pending session")]
    Timeout,
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure reported by a backend entry point.
///
/// Backends convert their engine's native error into this message-carrying
/// form before it crosses back into the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ApiCallError> for ScriptError {
    fn from(err: ApiCallError) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_fault_message_names_operation_and_address() {
        let err = BridgeError::MemoryFault {
            operation: "read_u32",
            address: 0x8000_0010,
        };
        assert_eq!(
            err.to_string(),
            "attempt to read_u32 at address 0x80000010 failed"
        );
        assert!(err.is_memory_fault());
    }

    #[test]
    fn unrecognized_type_lists_valid_names() {
        let err = BridgeError::UnrecognizedType {
            name: "u128".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("\"u128\""));
        assert!(message.contains("u8"));
        assert!(message.contains("wrapper"));
        assert!(!err.is_memory_fault());
    }

    #[test]
    fn api_call_error_appends_usage() {
        let err = ApiCallError {
            class: "memory",
            function: "read".to_string(),
            usage: "memory:read(\"u32\", 0x80000043)",
            error: BridgeError::InvalidWidth(3),
        };
        let message = err.to_string();
        assert!(message.starts_with("Error in memory:read(): invalid size 3"));
        assert!(message.ends_with("Example usage: 'memory:read(\"u32\", 0x80000043)'"));
    }

    #[test]
    fn api_call_error_usage_variant_is_not_repeated() {
        let err = ApiCallError {
            class: "memory",
            function: "write_string".to_string(),
            usage: "memory:write_string(0x80000043, \"text\")",
            error: BridgeError::Usage {
                example: "memory:write_string(0x80000043, \"text\")",
            },
        };
        let message = err.to_string();
        assert_eq!(message.matches("write_string(0x80000043").count(), 1);
    }

    #[test]
    fn script_error_from_api_error_keeps_message() {
        let api = ApiCallError {
            class: "controller",
            function: "set_inputs".to_string(),
            usage: "",
            error: BridgeError::InvalidPort(7),
        };
        let script: ScriptError = api.clone().into();
        assert_eq!(script.message, api.to_string());
    }

    #[test]
    fn top_level_error_wraps_sources() {
        let err: Error = QueueError::Closed.into();
        assert_eq!(err.to_string(), "Queue error: pending-session queue is closed");
    }
}
