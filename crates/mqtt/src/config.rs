//! Connection and endpoint configuration for the telemetry channel.
//!
//! All structures derive `serde` and `validator::Validate`, so they can be
//! embedded in the agent's TOML configuration or built programmatically once
//! the identity bundle is on disk.

use std::path::Path;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::TransferError;

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker hostname, e.g. the device's IoT data endpoint.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// MQTT client identifier. Empty means a random UUID.
    #[validate(length(max = 128, message = "Client ID must not exceed 128 characters"))]
    pub client_id: String,

    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    pub clean_session: bool,

    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    #[validate(range(
        min = 64,
        max = 65535,
        message = "Max packet size must be between 64 and 65535 bytes"
    ))]
    pub max_packet_size: Option<u16>,

    /// Capacity of the request queue between `AsyncClient` and the event loop.
    #[validate(range(
        min = 1,
        max = 255,
        message = "Request channel capacity must be between 1 and 255"
    ))]
    pub request_channel_capacity: Option<u8>,

    /// Fixed delay between reconnect attempts after a transient error.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Longest a publish may wait for room in the request queue. The queue
    /// only drains while connected, so a dead broker fills it.
    #[validate(range(
        min = 10,
        max = 60_000,
        message = "Publish timeout must be between 10 and 60000 milliseconds"
    ))]
    pub publish_timeout_millis: u64,

    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 8883,
            client_id: Uuid::new_v4().to_string(),
            keep_alive: 60,
            clean_session: true,
            max_inflight: 100,
            max_packet_size: Some(65_535),
            request_channel_capacity: Some(100),
            reconnect_delay: 5,
            publish_timeout_millis: 1000,
            tls: None,
        }
    }
}

/// Paths to the PEM files authenticating the connection.
///
/// Files are checked when the client is built, not at deserialization time,
/// because the agent writes them only after provisioning succeeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    /// Mutual TLS: CA plus client certificate and key.
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Checks that every configured file exists and that client auth is
    /// either complete or absent.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }
        Ok(())
    }
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }
    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }
    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }
    Ok(())
}

/// Where and how a payload is published.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EndpointMetadata {
    #[validate(range(min = 0, max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    #[validate(length(min = 1, message = "Topic must not be empty"))]
    pub topic: String,

    pub retain: bool,
}

impl Default for EndpointMetadata {
    fn default() -> Self {
        Self {
            qos: 0,
            topic: String::new(),
            retain: false,
        }
    }
}

impl EndpointMetadata {
    /// Fire-and-forget, non-retained publish to `topic`.
    pub fn at_most_once(topic: impl Into<String>) -> Self {
        Self {
            qos: 0,
            topic: topic.into(),
            retain: false,
        }
    }

    pub fn qos(&self) -> Result<QoS, TransferError> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(TransferError::InvalidMetadata(format!(
                "Invalid QoS value {other}, must be 0, 1, or 2"
            ))),
        }
    }
}
