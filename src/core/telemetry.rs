//! Periodic telemetry once the device holds a valid identity.
//!
//! Every tick probes connectivity, waits for the network if it is down,
//! re-checks right before sending, and publishes one message carrying a
//! monotonically increasing counter. The counter only moves after a
//! successful publish, so a skipped or failed tick never burns a value.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::AgentError;

/// Reachability as seen by the publisher.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Fresh check, never a cached value.
    async fn is_connected(&self) -> bool;

    async fn wait_for_network(&self, max_wait: Duration) -> bool;
}

/// Destination for telemetry payloads.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: &TelemetryPayload) -> Result<(), AgentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryPayload {
    pub message: String,
    /// Unix seconds.
    pub timestamp: u64,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

impl TelemetryPayload {
    pub fn new(counter: u64, device_id: &str) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            message: format!("Incremental value: {counter}"),
            timestamp,
            device_id: device_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Sent with this counter value.
    Published(u64),
    /// Network stayed down for the whole wait budget.
    Offline,
    /// Connectivity dropped between the first check and the send.
    Flipped,
    Failed,
}

pub struct TelemetryPublisher {
    connectivity: Arc<dyn Connectivity>,
    publisher: Arc<dyn Publisher>,
    device_id: String,
    network_wait: Duration,
    shutdown_grace: Duration,
    cancel: CancellationToken,
    counter: u64,
    last_connected: bool,
}

impl TelemetryPublisher {
    pub fn new(
        connectivity: Arc<dyn Connectivity>,
        publisher: Arc<dyn Publisher>,
        device_id: impl Into<String>,
        network_wait: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connectivity,
            publisher,
            device_id: device_id.into(),
            network_wait,
            shutdown_grace: Duration::ZERO,
            cancel,
            counter: 0,
            last_connected: true,
        }
    }

    /// How long a tick that is running when cancellation arrives may still
    /// take before it is abandoned.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Next value to be published.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let connected = self.connectivity.is_connected().await;
        if connected != self.last_connected {
            if connected {
                info!("Network connection restored");
            } else {
                warn!("Network connection lost, pausing telemetry");
            }
            self.last_connected = connected;
        }

        if !connected {
            let restored = tokio::select! {
                restored = self.connectivity.wait_for_network(self.network_wait) => restored,
                _ = self.cancel.cancelled() => false,
            };
            if !restored {
                debug!("Network still unavailable, skipping tick");
                return TickOutcome::Offline;
            }
            info!("Network connection restored");
            self.last_connected = true;
        }

        let payload = TelemetryPayload::new(self.counter, &self.device_id);
        if !self.connectivity.is_connected().await {
            debug!(counter = self.counter, "Connectivity dropped before send, skipping tick");
            return TickOutcome::Flipped;
        }

        match self.publisher.publish(&payload).await {
            Ok(()) => {
                let sent = self.counter;
                self.counter += 1;
                debug!(counter = sent, "Telemetry published");
                TickOutcome::Published(sent)
            }
            Err(e) => {
                error!(counter = self.counter, "Failed to publish telemetry: {}", e);
                TickOutcome::Failed
            }
        }
    }

    /// Ticks every `interval` until cancelled. A tick already running gets
    /// the shutdown grace period to finish.
    pub async fn run(&mut self, interval: Duration) {
        info!(
            interval_millis = interval.as_millis() as u64,
            "Telemetry publishing started"
        );
        let cancel = self.cancel.clone();
        let grace = self.shutdown_grace;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let tick = self.tick();
            tokio::pin!(tick);
            tokio::select! {
                _ = &mut tick => {}
                _ = cancel.cancelled() => {
                    if tokio::time::timeout(grace, tick).await.is_err() {
                        warn!(
                            grace_millis = grace.as_millis() as u64,
                            "Tick still running after the shutdown grace period, abandoning it"
                        );
                    }
                    break;
                }
            }
        }
        info!(published = self.counter, "Telemetry publishing stopped");
    }
}

/// Telemetry over the device's MQTT channel.
#[cfg(feature = "telemetry")]
pub mod mqtt {
    use edgebee_mqtt::{config::TlsConfig, EndpointMetadata, MqttManager};

    use super::*;
    use crate::{
        config::{agent::TelemetryConfig, device::DeviceIdentity},
        core::{certs::CertificateStore, connectivity::ConnectivityProbe, orchestrator::TelemetryPhase},
    };

    pub struct MqttSink {
        publisher: edgebee_mqtt::Publisher,
        endpoint: EndpointMetadata,
    }

    #[async_trait]
    impl Publisher for MqttSink {
        async fn publish(&self, payload: &TelemetryPayload) -> Result<(), AgentError> {
            self.publisher.publish(payload, &self.endpoint).await?;
            Ok(())
        }
    }

    /// Opens the broker connection with the stored identity and publishes
    /// until cancelled or until the connection dies for good.
    pub struct MqttTelemetryPhase {
        identity: DeviceIdentity,
        store: CertificateStore,
        config: TelemetryConfig,
        probe: ConnectivityProbe,
    }

    impl MqttTelemetryPhase {
        pub fn new(
            identity: DeviceIdentity,
            store: CertificateStore,
            config: TelemetryConfig,
            probe: ConnectivityProbe,
        ) -> Self {
            Self {
                identity,
                store,
                config,
                probe,
            }
        }

        fn broker_config(&self) -> edgebee_mqtt::Config {
            let paths = self.store.paths(&self.identity.device_id);
            edgebee_mqtt::Config {
                host: self.identity.iot_endpoint.clone(),
                port: self.config.port,
                client_id: self.identity.device_id.clone(),
                keep_alive: self.config.keep_alive,
                // a publish that cannot be queued within one tick fails that tick
                publish_timeout_millis: self.config.tick_interval_millis.clamp(10, 60_000),
                tls: Some(TlsConfig::new(
                    paths.root_ca.to_string_lossy(),
                    paths.certificate.to_string_lossy(),
                    paths.private_key.to_string_lossy(),
                )),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TelemetryPhase for MqttTelemetryPhase {
        async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
            if !self.store.has_identity(&self.identity.device_id) {
                return Err(AgentError::Telemetry(format!(
                    "identity bundle for {} is incomplete in {}",
                    self.identity.device_id,
                    self.store.dir().display()
                )));
            }

            let instance = Arc::new(
                MqttManager::from_config(self.broker_config())?
                    .build_and_start()
                    .await?,
            );
            let sink = MqttSink {
                publisher: edgebee_mqtt::Publisher::new(instance.clone()),
                endpoint: EndpointMetadata {
                    qos: self.config.qos,
                    topic: self.config.topic.clone(),
                    retain: false,
                },
            };

            let mut publisher = TelemetryPublisher::new(
                Arc::new(self.probe.clone()),
                Arc::new(sink),
                self.identity.device_id.clone(),
                self.config.network_wait(),
                cancel.clone(),
            )
            .with_shutdown_grace(self.config.shutdown_grace());

            let result = tokio::select! {
                _ = publisher.run(self.config.tick_interval()) => Ok(()),
                _ = instance.closed() => Err(AgentError::Telemetry(
                    "broker connection closed".into(),
                )),
            };

            instance.shutdown(self.config.shutdown_grace()).await;
            result
        }
    }
}
