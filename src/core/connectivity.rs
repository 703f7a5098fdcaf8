//! Internet reachability.
//!
//! A probe races independent signals (HTTP GETs, a DNS lookup and a TCP
//! connect) and reports connected as soon as any one of them succeeds. The
//! remaining checks are aborted. Fresh probes never touch the cached
//! snapshot; only the optional background monitor writes it.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use reqwest::Client;
use tokio::{
    net::TcpStream,
    sync::{watch, Notify},
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::agent::ConnectivityConfig;

/// One independent reachability check.
#[async_trait]
pub trait Signal: Send + Sync {
    fn name(&self) -> String;

    /// Upper bound the probe enforces on [`Signal::check`].
    fn timeout(&self) -> Duration;

    async fn check(&self) -> Result<(), String>;
}

/// GET on a well-known URL; any 2xx or 3xx counts.
pub struct HttpSignal {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpSignal {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Signal for HttpSignal {
    fn name(&self) -> String {
        format!("http {}", self.url)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn check(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(format!("status {status}"))
        }
    }
}

/// Resolves a well-known host name.
pub struct DnsSignal {
    host: String,
    timeout: Duration,
}

impl DnsSignal {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Signal for DnsSignal {
    fn name(&self) -> String {
        format!("dns {}", self.host)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn check(&self) -> Result<(), String> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), 0))
            .await
            .map_err(|e| e.to_string())?;
        addrs
            .next()
            .map(|_| ())
            .ok_or_else(|| "no addresses".to_string())
    }
}

/// Opens a TCP connection to `host:port`.
pub struct TcpSignal {
    target: String,
    timeout: Duration,
}

impl TcpSignal {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Signal for TcpSignal {
    fn name(&self) -> String {
        format!("tcp {}", self.target)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn check(&self) -> Result<(), String> {
        TcpStream::connect(self.target.as_str())
            .await
            .map(drop)
            .map_err(|e| e.to_string())
    }
}

/// Result of the most recent probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub connected: bool,
    pub observed_at: SystemTime,
    /// Why the probe failed, or which signal answered.
    pub cause: Option<String>,
}

impl ConnectivitySnapshot {
    fn unknown() -> Self {
        Self {
            connected: false,
            observed_at: SystemTime::UNIX_EPOCH,
            cause: Some("not probed yet".into()),
        }
    }
}

impl fmt::Display for ConnectivitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.connected { "online" } else { "offline" };
        match &self.cause {
            Some(cause) => write!(f, "{state} ({cause})"),
            None => f.write_str(state),
        }
    }
}

struct Monitor {
    cancel: CancellationToken,
    /// Asks the monitor to probe before its next scheduled tick.
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct Inner {
    signals: Vec<Arc<dyn Signal>>,
    snapshot: watch::Sender<ConnectivitySnapshot>,
    monitor_interval: Duration,
    wait_poll_interval: Duration,
    monitor: Mutex<Option<Monitor>>,
}

/// Cheap to clone; clones share the snapshot and the monitor.
#[derive(Clone)]
pub struct ConnectivityProbe {
    inner: Arc<Inner>,
}

impl ConnectivityProbe {
    pub fn new(
        signals: Vec<Arc<dyn Signal>>,
        monitor_interval: Duration,
        wait_poll_interval: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(ConnectivitySnapshot::unknown());
        Self {
            inner: Arc::new(Inner {
                signals,
                snapshot,
                monitor_interval,
                wait_poll_interval,
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Builds the HTTP, DNS and TCP signals described by `config`. Empty
    /// targets are left out.
    pub fn from_config(config: &ConnectivityConfig) -> Result<Self, reqwest::Error> {
        let http_timeout = Duration::from_secs(config.http_timeout_secs);
        let client = Client::builder().timeout(http_timeout).build()?;

        let mut signals: Vec<Arc<dyn Signal>> = config
            .http_targets
            .iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| {
                Arc::new(HttpSignal::new(client.clone(), url.trim(), http_timeout))
                    as Arc<dyn Signal>
            })
            .collect();
        if !config.dns_name.trim().is_empty() {
            signals.push(Arc::new(DnsSignal::new(
                config.dns_name.trim(),
                Duration::from_secs(config.dns_timeout_secs),
            )));
        }
        if !config.tcp_target.trim().is_empty() {
            signals.push(Arc::new(TcpSignal::new(
                config.tcp_target.trim(),
                Duration::from_secs(config.tcp_timeout_secs),
            )));
        }

        debug!(signals = signals.len(), "Connectivity probe configured");
        Ok(Self::new(
            signals,
            Duration::from_secs(config.monitor_interval_secs),
            Duration::from_millis(config.wait_poll_interval_millis),
        ))
    }

    /// Races every signal. The cached snapshot is left alone.
    pub async fn check_fresh(&self) -> ConnectivitySnapshot {
        let snapshot = race(&self.inner.signals).await;
        trace!(%snapshot, "Connectivity probed");
        snapshot
    }

    pub async fn is_available(&self) -> bool {
        self.check_fresh().await.connected
    }

    /// Probes now, bypassing the monitor schedule. With a monitor running
    /// the monitor is woken and its next result is returned, so the cache
    /// keeps a single writer; otherwise this is a plain fresh check.
    pub async fn force_check(&self) -> ConnectivitySnapshot {
        let running = self.inner.monitor.lock().ok().and_then(|slot| {
            slot.as_ref()
                .filter(|m| !m.handle.is_finished())
                .map(|m| (m.wake.clone(), m.cancel.clone()))
        });
        let Some((wake, stopped)) = running else {
            return self.check_fresh().await;
        };

        let mut updates = self.inner.snapshot.subscribe();
        wake.notify_one();
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_ok() {
                    return updates.borrow_and_update().clone();
                }
            }
            _ = stopped.cancelled() => {}
        }
        self.check_fresh().await
    }

    /// Last result recorded by the monitor, without probing.
    pub fn cached(&self) -> ConnectivitySnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Probes every `wait_poll_interval` until connected or `max_wait`
    /// elapses.
    pub async fn wait_for_network(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.is_available().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.inner.wait_poll_interval.min(deadline - now)).await;
        }
    }

    /// Starts the background monitor. A second call while running is a
    /// no-op. Must be called inside a tokio runtime.
    pub fn start_monitoring(&self) {
        let Ok(mut slot) = self.inner.monitor.lock() else {
            warn!("Monitor lock poisoned, not starting");
            return;
        };
        if slot.as_ref().is_some_and(|m| !m.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let probe = self.clone();
        let token = cancel.clone();
        let woken = wake.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.inner.monitor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<bool> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = woken.notified() => {}
                    _ = ticker.tick() => {}
                }
                let snapshot = tokio::select! {
                    _ = token.cancelled() => break,
                    snapshot = probe.check_fresh() => snapshot,
                };
                if last != Some(snapshot.connected) {
                    info!(%snapshot, "Network state changed");
                    last = Some(snapshot.connected);
                }
                probe.inner.snapshot.send_replace(snapshot);
            }
            debug!("Connectivity monitor stopped");
        });

        info!(
            interval_secs = self.inner.monitor_interval.as_secs(),
            "Connectivity monitor started"
        );
        *slot = Some(Monitor {
            cancel,
            wake,
            handle,
        });
    }

    /// Stops the monitor and waits for its task to exit.
    pub async fn stop_monitoring(&self) {
        let monitor = match self.inner.monitor.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            if let Err(e) = monitor.handle.await {
                warn!("Connectivity monitor task failed: {}", e);
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|m| !m.handle.is_finished()))
            .unwrap_or(false)
    }
}

/// First success wins; the JoinSet drop aborts the rest.
async fn race(signals: &[Arc<dyn Signal>]) -> ConnectivitySnapshot {
    if signals.is_empty() {
        return ConnectivitySnapshot {
            connected: false,
            observed_at: SystemTime::now(),
            cause: Some("no signals configured".into()),
        };
    }

    let mut set = JoinSet::new();
    for signal in signals {
        let signal = signal.clone();
        set.spawn(async move {
            let name = signal.name();
            let result = match timeout(signal.timeout(), signal.check()).await {
                Ok(result) => result,
                Err(_) => Err("timed out".to_string()),
            };
            (name, result)
        });
    }

    let mut failures = Vec::with_capacity(signals.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((name, Ok(()))) => {
                return ConnectivitySnapshot {
                    connected: true,
                    observed_at: SystemTime::now(),
                    cause: Some(format!("{name} reachable")),
                };
            }
            Ok((name, Err(e))) => failures.push(format!("{name}: {e}")),
            Err(e) => failures.push(format!("check panicked: {e}")),
        }
    }

    ConnectivitySnapshot {
        connected: false,
        observed_at: SystemTime::now(),
        cause: Some(failures.join("; ")),
    }
}

#[async_trait]
impl super::telemetry::Connectivity for ConnectivityProbe {
    async fn is_connected(&self) -> bool {
        self.is_available().await
    }

    async fn wait_for_network(&self, max_wait: Duration) -> bool {
        ConnectivityProbe::wait_for_network(self, max_wait).await
    }
}
