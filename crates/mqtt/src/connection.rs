//! Connection kernel driving the `rumqttc` event loop.
//!
//! `rumqttc` only makes progress while its `EventLoop` is polled; the kernel
//! owns that loop on a dedicated task, tracks [`ConnectionState`], and stops
//! cleanly when its cancellation token fires. After a transient error the
//! next poll reconnects, preceded by a fixed `reconnect_delay`.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{error::TransferError, state::ConnectionState};

const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Owns the event loop of one broker connection.
pub struct ConnectionKernel {
    client: AsyncClient,

    event_loop: EventLoop,

    reconnect_delay: Duration,

    cancel: CancellationToken,

    state_tx: watch::Sender<ConnectionState>,

    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionKernel {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        reconnect_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            reconnect_delay,
            cancel,
            state_tx,
            state_rx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    /// Polls the event loop until cancelled or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);
        info!("Starting connection event loop...");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, disconnecting from broker");
                    self.disconnect().await;
                    self.update_state(ConnectionState::Disconnected("shutdown".into()));
                    return Ok(());
                }

                event_result = self.event_loop.poll() => {
                    match event_result {
                        Ok(event) => self.handle_event(event),
                        Err(e) => {
                            if is_fatal_error(&e) {
                                error!("Fatal broker connection error: {}", get_error_message(&e));
                                self.update_state(ConnectionState::Disconnected(e.to_string()));
                                return Err(TransferError::from(e));
                            }

                            warn!(
                                "Reconnecting in {:.2} seconds due to error: {}",
                                self.reconnect_delay.as_secs_f64(),
                                get_error_message(&e)
                            );
                            self.update_state(ConnectionState::Reconnecting(
                                self.reconnect_delay.as_secs_f64(),
                            ));

                            tokio::select! {
                                _ = self.cancel.cancelled() => {}
                                _ = tokio::time::sleep(self.reconnect_delay) => {
                                    self.update_state(ConnectionState::Connecting);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Queues DISCONNECT and polls briefly so it reaches the broker.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Error sending disconnect packet: {:?}", e);
            return;
        }
        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush)
            .await
            .is_err()
        {
            debug!("Disconnect not flushed within {:?}", DISCONNECT_FLUSH_TIMEOUT);
        }
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    info!("Connection established successfully.");
                    self.update_state(ConnectionState::Connected);
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                trace!("Broker acknowledged publish pkid={}", ack.pkid);
            }
            Event::Incoming(packet) => {
                trace!("Incoming packet: {:?}", packet);
            }
            Event::Outgoing(outgoing) => {
                debug!("Outgoing packet: {:?}", outgoing);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    // reconnecting cannot help
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // invalid certificates or key material
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost error message, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::{client::ClientBuilder, Config};

    fn kernel(cancel: CancellationToken) -> ConnectionKernel {
        // nothing listens on port 1 so every poll fails with a transient error
        let config = Config {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "dev-1".into(),
            ..Default::default()
        };
        let (client, event_loop) = ClientBuilder::from_config(&config)
            .unwrap()
            .build()
            .unwrap();
        ConnectionKernel::new(client, event_loop, Duration::from_secs(1), cancel)
    }

    #[test]
    fn test_is_fatal_error_detection() {
        let refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_fatal_error(&refused));

        let denied = ConnectionError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "permission denied",
        ));
        assert!(is_fatal_error(&denied));

        assert!(is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized
        )));
        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout));
    }

    #[tokio::test]
    async fn test_state_subscription() {
        let kernel = kernel(CancellationToken::new());
        let mut state_rx = kernel.subscribe_state();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);

        kernel.update_state(ConnectionState::Connected);
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_kernel_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let kernel = kernel(cancel.clone());
        let state_rx = kernel.subscribe_state();

        let handle = tokio::spawn(kernel.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("kernel did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(matches!(
            *state_rx.borrow(),
            ConnectionState::Disconnected(_)
        ));
    }
}
