//! Error taxonomy of the provisioning agent.
//!
//! Transport and serialization errors abandon the current cycle; the next
//! scheduled poll retries naturally. Decryption and status errors abort only
//! the running pipeline. Only configuration errors and a missing identity
//! directory stop the process (see [`AgentError::is_fatal`]).

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

use super::{crypto::DecryptionError, status::DeviceStatus};

#[derive(Debug, Error)]
pub enum AgentError {
    /// Request never produced a response (DNS, TCP, TLS, timeout).
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Control plane answered with a non-success HTTP status.
    #[error("Control plane returned {0}: {1}")]
    Http(StatusCode, String),

    #[error("Malformed payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("Unexpected device status '{actual}', expected '{expected}'")]
    InvalidStatus {
        expected: DeviceStatus,
        actual: DeviceStatus,
    },

    /// Download answered but its body did not carry a success status code.
    #[error("No certificate found for the device (statusCode {0})")]
    NoCertificateFound(i64),

    #[error("Filesystem error on {path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The identity directory could not be created at all.
    #[error("Cannot create identity directory {path}: {source}")]
    IdentityDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Telemetry channel error: {0}")]
    Telemetry(String),
}

impl AgentError {
    pub fn file_system(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// True when retrying on the next cycle cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Configuration(_) | AgentError::IdentityDirectory { .. }
        )
    }
}

#[cfg(feature = "telemetry")]
impl From<edgebee_mqtt::TransferError> for AgentError {
    fn from(err: edgebee_mqtt::TransferError) -> Self {
        AgentError::Telemetry(err.to_string())
    }
}
