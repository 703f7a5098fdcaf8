//! JSON publishing on top of an [`MqttInstance`].
//!
//! # Examples
//!
//! ```ignore
//! use edgebee_mqtt::{EndpointMetadata, Publisher};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Reading { message: String }
//!
//! let publisher = Publisher::new(instance);
//! publisher
//!     .publish(&Reading { message: "hi".into() }, &EndpointMetadata::at_most_once("test/topic"))
//!     .await?;
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use validator::Validate;

use super::{config::EndpointMetadata, manager::MqttInstance, TransferError};

/// Serializes payloads to JSON and sends them to the broker.
///
/// Cheap to clone; clones share the instance.
#[derive(Clone)]
pub struct Publisher {
    instance: Arc<MqttInstance>,
}

impl Publisher {
    pub fn new(instance: Arc<MqttInstance>) -> Self {
        Self { instance }
    }

    /// Encodes `data` as JSON and publishes it per `metadata`.
    pub async fn publish<T: Serialize>(
        &self,
        data: &T,
        metadata: &EndpointMetadata,
    ) -> Result<(), TransferError> {
        metadata.validate()?;
        let payload = serde_json::to_vec(data)?;
        self.publish_raw(payload, metadata).await
    }

    /// Publishes pre-encoded bytes.
    pub async fn publish_raw(
        &self,
        payload: Vec<u8>,
        metadata: &EndpointMetadata,
    ) -> Result<(), TransferError> {
        let qos = metadata.qos()?;
        debug!(
            topic = %metadata.topic,
            bytes = payload.len(),
            "Publishing payload"
        );
        self.instance
            .publish(&metadata.topic, qos, metadata.retain, payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{Config, MqttManager};

    async fn instance() -> Arc<MqttInstance> {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 1,
            client_id: "dev-1".into(),
            ..Default::default()
        };
        Arc::new(
            MqttManager::from_config(config)
                .unwrap()
                .build_and_start()
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_topic() {
        let instance = instance().await;
        let publisher = Publisher::new(instance.clone());

        let result = publisher
            .publish(&serde_json::json!({"message": "x"}), &EndpointMetadata::default())
            .await;
        assert!(matches!(result, Err(TransferError::ConfigError(_))));

        instance.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_publish_queues_while_offline() {
        let instance = instance().await;
        let publisher = Publisher::new(instance.clone());

        // requests are buffered by the client even without a broker
        let result = publisher
            .publish(
                &serde_json::json!({"message": "Incremental value: 0"}),
                &EndpointMetadata::at_most_once("test/topic"),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(instance.publish_drain().inflight(), 0);

        instance.shutdown(Duration::from_millis(50)).await;
    }
}
