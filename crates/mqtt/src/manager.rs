//! Wires the client, the connection kernel and the shutdown drain together.
//!
//! [`MqttManager::build_and_start`] spawns the kernel and hands back an
//! [`MqttInstance`]. Shutdown happens in two stages: the instance's token
//! stops new publishes, and the kernel token fires only after every
//! in-flight publish has finished (or the grace window ran out).

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, QoS};
use tokio::{
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    client::ClientBuilder, config::Config, connection::ConnectionKernel, error::TransferError,
    state::ConnectionState,
};

/// Counts publishes that are still being handed to the client.
#[derive(Debug, Default)]
pub struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            // register before checking so a concurrent release is not missed
            let notified = self.notify.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

/// Entry point for building the telemetry channel.
pub struct MqttManager {
    config: Config,

    cancel_token: CancellationToken,
}

impl MqttManager {
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        Ok(Self {
            config,
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the client and spawns the connection kernel.
    ///
    /// The broker handshake happens asynchronously after this returns; watch
    /// [`MqttInstance::state_receiver`] to learn when it completes.
    pub async fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "Building telemetry channel"
        );

        let (client, event_loop) = ClientBuilder::from_config(&self.config)?.build()?;

        // Fires only after the publish drain completes.
        let connection_cancel = CancellationToken::new();
        let kernel = ConnectionKernel::new(
            client.clone(),
            event_loop,
            Duration::from_secs(self.config.reconnect_delay),
            connection_cancel.clone(),
        );
        let state_rx = kernel.subscribe_state();
        let publish_drain = Arc::new(PublishDrain::new());

        let kernel_done = CancellationToken::new();
        let kernel_handle = {
            let done = kernel_done.clone();
            tokio::spawn(async move {
                if let Err(e) = kernel.run().await {
                    error!("Connection kernel exited with error: {}", e);
                }
                done.cancel();
            })
        };

        // Bridge: shutdown request -> wait drain -> stop kernel.
        {
            let shutdown_request = self.cancel_token.clone();
            let drain = publish_drain.clone();
            let conn_cancel = connection_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown_request.cancelled() => {}
                    _ = conn_cancel.cancelled() => return,
                }
                drain.wait_idle().await;
                conn_cancel.cancel();
            });
        }

        Ok(MqttInstance {
            client,
            publish_timeout: Duration::from_millis(self.config.publish_timeout_millis),
            state_rx,
            cancel_token: self.cancel_token,
            connection_cancel,
            publish_drain,
            kernel_done,
            kernel_handle: Mutex::new(Some(kernel_handle)),
        })
    }
}

/// A running broker connection.
#[derive(Debug)]
pub struct MqttInstance {
    client: AsyncClient,

    publish_timeout: Duration,

    state_rx: watch::Receiver<ConnectionState>,

    /// Shutdown request; new publishes are refused once cancelled.
    cancel_token: CancellationToken,

    /// Stops the connection kernel.
    connection_cancel: CancellationToken,

    publish_drain: Arc<PublishDrain>,

    /// Cancelled once the connection kernel has exited.
    kernel_done: CancellationToken,

    kernel_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttInstance {
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn publish_drain(&self) -> Arc<PublishDrain> {
        self.publish_drain.clone()
    }

    /// Resolves when the connection kernel stops, either after shutdown or
    /// on a fatal connection error.
    pub async fn closed(&self) {
        self.kernel_done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.kernel_done.is_cancelled()
    }

    /// Queues one publish. Shutdown waits for it to be handed to the client.
    ///
    /// Fails with [`TransferError::PublishTimeout`] when the request queue
    /// has no room within the configured publish timeout; nothing is queued
    /// in that case.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransferError> {
        if self.cancel_token.is_cancelled() {
            return Err(TransferError::ShuttingDown);
        }
        let _guard = self.publish_drain.enter();
        tokio::time::timeout(
            self.publish_timeout,
            self.client.publish(topic, qos, retain, payload),
        )
        .await
        .map_err(|_| TransferError::PublishTimeout(self.publish_timeout))??;
        debug!(topic, "Publish queued");
        Ok(())
    }

    /// Stops accepting publishes, drains in-flight ones for at most `grace`,
    /// then disconnects and waits for the kernel to exit.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_token.cancel();

        if tokio::time::timeout(grace, self.publish_drain.wait_idle())
            .await
            .is_err()
        {
            warn!(
                inflight = self.publish_drain.inflight(),
                "Grace period elapsed with publishes still in flight"
            );
        }
        self.connection_cancel.cancel();

        if let Some(handle) = self.kernel_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Connection kernel task failed: {}", e);
            }
        }
        info!("Telemetry channel closed");
    }
}
