//! # edgebee-mqtt: telemetry channel for provisioned edge devices
//!
//! A small async MQTT layer built on top of `rumqttc`. It owns exactly one
//! broker connection authenticated with the device identity bundle (client
//! certificate, private key and root CA) and exposes:
//!
//! - **Connection kernel** driving the `rumqttc` event loop, with a fixed
//!   delay between reconnect attempts and fatal/transient error classification
//! - **State monitoring** through a `watch` channel of [`ConnectionState`]
//! - **In-order publishing** of JSON payloads via [`Publisher`]
//! - **Graceful shutdown**: in-flight publishes drain before the connection
//!   is released, bounded by a caller-provided grace window
//!
//! # Quick Start
//!
//! ```ignore
//! use edgebee_mqtt::{config::TlsConfig, Config, EndpointMetadata, MqttManager, Publisher};
//!
//! let config = Config {
//!     host: "a1b2c3-ats.iot.eu-west-1.amazonaws.com".into(),
//!     port: 8883,
//!     client_id: "dev-1".into(),
//!     tls: Some(TlsConfig::new(
//!         "certs/dev-1_AmazonRootCA1.pem",
//!         "certs/dev-1_certificate.pem.crt",
//!         "certs/dev-1_private.pem.key",
//!     )),
//!     ..Default::default()
//! };
//!
//! let instance = std::sync::Arc::new(MqttManager::from_config(config)?.build_and_start().await?);
//! let publisher = Publisher::new(instance.clone());
//! publisher
//!     .publish(&serde_json::json!({"message": "hello"}), &EndpointMetadata::at_most_once("test/topic"))
//!     .await?;
//! instance.shutdown(std::time::Duration::from_secs(2)).await;
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting ──(CONNACK)──> Connected
//!                              │
//!                       (network error)
//!                              │
//!                              ▼
//!                      Reconnecting(secs) ──(delay elapsed)──> Connecting
//! ```
//!
//! Fatal errors (TLS failures, refused credentials) move the kernel to
//! `Disconnected` and stop it; everything else is retried after
//! `reconnect_delay` seconds.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod publisher;
pub mod state;

pub use client::ClientBuilder;
pub use config::{Config, EndpointMetadata};
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager};
pub use publisher::Publisher;
pub use state::ConnectionState;

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, TransferError>;
