//! Tunables of the provisioning loop, the connectivity probe and the
//! telemetry channel. Every field has a default, so all three tables are
//! optional in the configuration file.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Directory holding the identity bundle.
    #[validate(length(min = 1, message = "certs_dir must not be empty"))]
    pub certs_dir: String,

    /// Seconds between two status polls.
    #[validate(range(min = 1, max = 3600))]
    pub poll_interval_secs: u64,

    /// Per-request timeout toward the control plane.
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,

    /// Skip TLS certificate verification toward the control plane.
    pub accept_invalid_certs: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            certs_dir: "certs".to_string(),
            poll_interval_secs: 10,
            request_timeout_secs: 30,
            accept_invalid_certs: false,
        }
    }
}

impl ProvisioningConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// URLs probed with a GET; any 2xx/3xx answer counts as reachable.
    pub http_targets: Vec<String>,

    /// Host name resolved by the DNS signal. Empty disables the signal.
    pub dns_name: String,

    /// `host:port` dialled by the TCP signal. Empty disables the signal.
    pub tcp_target: String,

    #[validate(range(min = 1, max = 60))]
    pub http_timeout_secs: u64,

    #[validate(range(min = 1, max = 60))]
    pub dns_timeout_secs: u64,

    #[validate(range(min = 1, max = 60))]
    pub tcp_timeout_secs: u64,

    /// Re-probe interval of the background monitor.
    #[validate(range(min = 1, max = 3600))]
    pub monitor_interval_secs: u64,

    /// Poll interval of `wait_for_network`.
    #[validate(range(min = 10, max = 60_000))]
    pub wait_poll_interval_millis: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            http_targets: vec![
                "https://www.google.com".to_string(),
                "https://www.cloudflare.com".to_string(),
                "https://www.amazon.com".to_string(),
            ],
            dns_name: "google.com".to_string(),
            tcp_target: "8.8.8.8:53".to_string(),
            http_timeout_secs: 3,
            dns_timeout_secs: 3,
            tcp_timeout_secs: 2,
            monitor_interval_secs: 5,
            wait_poll_interval_millis: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetryConfig {
    #[validate(length(min = 1, message = "Telemetry topic must not be empty"))]
    pub topic: String,

    #[validate(range(min = 10, max = 3_600_000))]
    pub tick_interval_millis: u64,

    /// Longest a single tick blocks waiting for the network.
    #[validate(range(min = 1, max = 86_400))]
    pub network_wait_secs: u64,

    /// Time given to the last publish before the channel is released.
    #[validate(range(max = 60_000))]
    pub shutdown_grace_millis: u64,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub qos: u8,

    #[validate(range(min = 5, max = 3600))]
    pub keep_alive: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            topic: "test/topic".to_string(),
            tick_interval_millis: 1000,
            network_wait_secs: 300,
            shutdown_grace_millis: 2000,
            port: 8883,
            qos: 0,
            keep_alive: 60,
        }
    }
}

impl TelemetryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_millis)
    }

    pub fn network_wait(&self) -> Duration {
        Duration::from_secs(self.network_wait_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }
}
