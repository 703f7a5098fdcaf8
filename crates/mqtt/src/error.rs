//! Error handling for the telemetry channel.
//!
//! `TransferError` aggregates configuration, TLS material, serialization and
//! broker connectivity failures into one type the agent can match on.
//!
//! **Setup errors** (`ClientSetup`, `ConfigError`, `Io`) mean the identity
//! bundle or the endpoint configuration is unusable; the caller should not
//! retry until provisioning changes something.
//!
//! **Runtime errors** (`ClientTransfer`, `ClientConnection`,
//! `ConnectionConnectionState`) are transient; the connection kernel keeps
//! reconnecting on its own.

use thiserror::Error;

/// The unified error type for telemetry channel operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Endpoint metadata is invalid (QoS outside 0..=2, empty topic).
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// MQTT client initialization failed, usually unreadable or missing
    /// certificate files.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The local client could not queue a request (event loop gone).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Connection to the broker failed or was lost.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// MQTT state machine violation reported by `rumqttc`.
    #[error("Client connection state error: {0}")]
    ConnectionConnectionState(#[from] rumqttc::StateError),

    /// The request queue stayed full for the whole publish timeout, which
    /// happens while the broker is unreachable.
    #[error("Publish not queued within {0:?}")]
    PublishTimeout(std::time::Duration),

    /// Publish attempted after shutdown was requested.
    #[error("Telemetry channel is shutting down")]
    ShuttingDown,

    /// File I/O failure while loading TLS material.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::InvalidMetadata("QoS must be 0-2".into());
        assert_eq!(err.to_string(), "Invalid metadata: QoS must be 0-2");
    }

    #[test]
    fn test_transfer_error_client_setup() {
        let err = TransferError::ClientSetup("TLS certificate not found".into());
        assert!(err.to_string().contains("TLS certificate not found"));
    }

    #[test]
    fn test_transfer_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let transfer_err: TransferError = io_err.into();
        assert!(transfer_err.to_string().contains("file not found"));
    }

    #[test]
    fn test_transfer_error_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let transfer_err: TransferError = json_err.into();
        assert!(matches!(transfer_err, TransferError::Serialization(_)));
    }
}
