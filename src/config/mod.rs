//! Application configuration loading, validation, and management.
//!
//! The top-level `Config` aggregates logging, device identity and the agent
//! tunables. It is read from a TOML file, overlaid with the identity
//! environment variables (`.env` included) and validated once at startup;
//! it is immutable thereafter.

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use self::{
    agent::{ConnectivityConfig, ProvisioningConfig, TelemetryConfig},
    device::DeviceIdentity,
    logger::LoggerConfig,
};

pub mod agent;
pub mod device;
pub mod logger;

pub const CONFIG_ENV: &str = "EDGEBEE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgebee/config.toml";

/// Timestamped console line for use before the tracing subscriber exists.
#[doc(hidden)]
pub fn print_line(level: console::StyledObject<&'static str>, args: fmt::Arguments<'_>) {
    let now = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    println!("{}  {} {}", console::style(now).dim(), level, args);
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("INFO").green(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("WARN").yellow(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("ERROR").red(), format_args!($($arg)*))
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
#[validate(schema(function = "validate_telemetry_endpoint"))]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub device: DeviceIdentity,

    #[validate(nested)]
    pub provisioning: ProvisioningConfig,

    #[validate(nested)]
    pub connectivity: ConnectivityConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// The broker endpoint is needed only when telemetry is compiled in.
fn validate_telemetry_endpoint(config: &Config) -> Result<(), ValidationError> {
    if cfg!(feature = "telemetry") && config.device.iot_endpoint.trim().is_empty() {
        return Err(ValidationError::new("missing_iot_endpoint")
            .with_message("IOT_ENDPOINT must be set when telemetry is enabled".into()));
    }
    Ok(())
}

impl Config {
    /// Locates the configuration file, overlays the environment and
    /// validates the result.
    pub fn new() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => print_info!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => print_warn!("Ignoring unreadable .env file: {}", e),
        }

        let mut config = match Self::get_config_path() {
            Some(path) => Self::load(&path)?,
            None => {
                print_warn!(
                    "No configuration file found, using defaults and environment variables"
                );
                Config::default()
            }
        };
        config.device.apply_env();
        config.validated()
    }

    /// Priority: `EDGEBEE_CONFIG`, then `/etc/edgebee/config.toml`.
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Some(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Some(fallback.to_path_buf());
        }
        None
    }

    /// Parses a configuration file without validating it.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Config, ConfigError> {
        toml::from_str(config_str).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn validated(self) -> Result<Config, ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE: &str = r#"
[logger]
level = "debug"

[logger.console]
format = "json"

[device]
device_id = "dev-1"
secret_key = "sk"
device_from = "factory"
encryption_key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
base_url = "https://api.example.com/v1"
iot_endpoint = "broker.example.com"

[provisioning]
certs_dir = "/var/lib/edgebee/certs"
poll_interval_secs = 15
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap().validated().unwrap();
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.device.device_id, "dev-1");
        assert_eq!(config.provisioning.certs_dir, "/var/lib/edgebee/certs");
        assert_eq!(config.provisioning.poll_interval_secs, 15);
        assert_eq!(config.telemetry.topic, "test/topic");
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/edgebee.toml"));
        assert!(matches!(result, Err(ConfigError::Config(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = Config::from_toml_str("[device\ndevice_id = 1");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_defaults_fail_validation_without_identity() {
        let result = Config::default().validated();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[cfg(feature = "telemetry")]
    #[test]
    fn test_iot_endpoint_required_with_telemetry() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.device.iot_endpoint.clear();
        let err = config.validated().unwrap_err();
        assert!(err.to_string().contains("IOT_ENDPOINT"));
    }
}
