//! Error types for wgplane

use thiserror::Error;

/// Result type alias using wgplane Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgplane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Conflict on {kind} {id}: {detail}")]
    Conflict {
        kind: String,
        id: String,
        detail: String,
    },

    #[error("WireGuard tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Apply failed on interface {interface}: {detail}")]
    ApplyFailed {
        interface: String,
        detail: String,
        exit_status: Option<i32>,
    },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Address pool exhausted for interface {interface} ({block})")]
    AddressPoolExhausted { interface: String, block: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Interface {0} is decommissioned")]
    InterfaceDecommissioned(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Conflict for a duplicate peer public key on an interface.
    pub fn duplicate_key(interface_id: &str, public_key: &str) -> Self {
        Error::Conflict {
            kind: "peer".to_string(),
            id: interface_id.to_string(),
            detail: format!("public key {} already enrolled", public_key),
        }
    }

    pub fn not_found(kind: &str, id: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether a driver error is transient and worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ApplyFailed { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::CacheUnavailable(e.to_string())
    }
}
