//! Error types and result definitions for the rusqara crate.
//! Covers transport/decode failures, resolution failures and bad caller parameters.

use thiserror::Error;

/// Represents all possible errors that can occur while talking to Mi/Aqara gateways.
#[derive(Error, Debug, Clone)]
pub enum AqaraError {
    /// Standard IO error (socket bind, multicast membership, send, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// An inbound datagram did not match the expected envelope shape
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Gateway sid not found in the registry
    #[error("Gateway '{0}' not found")]
    GatewayNotFound(String),

    /// Device sid not found in the registry
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// Device sid has no owning gateway in the index
    #[error("No gateway known for device '{0}'")]
    GatewayUnresolved(String),

    /// The gateway is known but has no usable network address yet
    #[error("Gateway '{0}' has no address")]
    GatewayUnaddressed(String),

    /// The gateway has not reported a session token yet, writes cannot be keyed
    #[error("Gateway '{0}' has no session token")]
    MissingToken(String),

    /// Key material (password, token or IV) has the wrong length for AES-128
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// A `change` request was missing its payload or a usable selector
    #[error("Bad parameters: {0}")]
    BadParameters(String),

    /// The engine has been stopped, its command channel is closed
    #[error("Engine not running")]
    EngineStopped,
}

/// A specialized Result type for rusqara operations.
pub type Result<T> = std::result::Result<T, AqaraError>;

impl From<std::io::Error> for AqaraError {
    fn from(err: std::io::Error) -> Self {
        AqaraError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AqaraError {
    fn from(err: serde_json::Error) -> Self {
        AqaraError::Json(err.to_string())
    }
}
