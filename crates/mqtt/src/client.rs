//! MQTT client builder with TLS client-certificate support.
//!
//! `ClientBuilder` turns a [`Config`] into a `rumqttc` `AsyncClient` /
//! `EventLoop` pair. Certificate files are read only in [`ClientBuilder::build`].

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};
use validator::Validate;

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

/// Builder for the `rumqttc` client and event loop.
pub struct ClientBuilder {
    opts: MqttOptions,

    /// Capacity of the request queue between client and event loop.
    cap: usize,

    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Creates a builder from a validated [`Config`].
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let mut opts = MqttOptions::new(client_id, config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);
        opts.set_inflight(config.max_inflight);
        if let Some(max_packet_size) = config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        let cap = config.request_channel_capacity.unwrap_or(10) as usize;

        let tls_config = config.tls.clone().filter(TlsConfig::is_enabled);

        Ok(Self {
            opts,
            cap,
            tls_config,
        })
    }

    fn load_file(path: &str) -> Result<Vec<u8>, TransferError> {
        Ok(fs::read(path)?)
    }

    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        tls_config
            .validate_config()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {}", e)))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("CA certificate path is not set".into()))?;
        let ca = Self::load_file(ca_path)?;

        let client_auth = match (
            tls_config.client_cert_path.as_deref(),
            tls_config.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }))
    }

    /// Constructs the client and its event loop.
    ///
    /// The event loop must be polled (see [`crate::ConnectionKernel`]) for the
    /// client's requests to reach the broker.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        if let Some(tls_config) = &self.tls_config {
            opts.set_transport(Self::build_tls_transport(tls_config)?);
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}
