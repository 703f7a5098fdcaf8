//! Device identity: who this device is and where its control plane lives.
//!
//! Values come from the `[device]` table of the configuration file and are
//! then overridden by environment variables (a `.env` file in the working
//! directory is loaded first, if present).

use std::fmt;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

pub const ENV_BASE_URL: &str = "BASE_URL";
pub const ENV_DEVICE_ID: &str = "DEVICE_ID";
pub const ENV_SECRET_KEY: &str = "SECRET_KEY";
pub const ENV_DEVICE_FROM: &str = "DEVICE_FROM";
pub const ENV_ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";
pub const ENV_IOT_ENDPOINT: &str = "IOT_ENDPOINT";

/// Immutable for the lifetime of the process once loaded.
#[derive(Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DeviceIdentity {
    #[validate(length(min = 1, message = "DEVICE_ID must be set"))]
    pub device_id: String,

    #[validate(length(min = 1, message = "SECRET_KEY must be set"))]
    pub secret_key: String,

    /// Free-form origin tag sent with the registration request.
    pub device_from: String,

    /// AES-256 key, hex encoded.
    #[validate(custom(function = "validate_encryption_key"))]
    pub encryption_key: String,

    /// Control plane base URL, e.g. `https://api.example.com/v1`.
    #[validate(url(message = "BASE_URL must be an absolute URL"))]
    pub base_url: String,

    /// MQTT broker host for telemetry.
    pub iot_endpoint: String,
}

impl DeviceIdentity {
    /// Overrides fields with environment values where present.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overrides fields with values returned by `lookup`; empty values are
    /// ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields: [(&str, &mut String); 6] = [
            (ENV_BASE_URL, &mut self.base_url),
            (ENV_DEVICE_ID, &mut self.device_id),
            (ENV_SECRET_KEY, &mut self.secret_key),
            (ENV_DEVICE_FROM, &mut self.device_from),
            (ENV_ENCRYPTION_KEY, &mut self.encryption_key),
            (ENV_IOT_ENDPOINT, &mut self.iot_endpoint),
        ];
        for (key, field) in fields {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *field = value.trim().to_string();
            }
        }
    }

    /// Joins `path` onto the base URL without doubling slashes.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

// Secrets stay out of logs.
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("secret_key", &"<redacted>")
            .field("device_from", &self.device_from)
            .field("encryption_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("iot_endpoint", &self.iot_endpoint)
            .finish()
    }
}

fn validate_encryption_key(key: &str) -> Result<(), ValidationError> {
    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::new("invalid_encryption_key").with_message(
            "ENCRYPTION_KEY must be exactly 64 hex characters (32 bytes)".into(),
        ));
    }
    Ok(())
}
