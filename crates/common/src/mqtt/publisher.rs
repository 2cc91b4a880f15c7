use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, QoS};

/// Trait for MQTT publish operations
/// Abstracts the broker client so producers can be tested without a broker
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    /// Queue a non-retained message for delivery on `topic`
    async fn publish(&self, topic: String, qos: QoS, payload: Bytes) -> anyhow::Result<()>;
}

/// [`MqttPublisher`] backed by a rumqttc client handle.
///
/// The request is handed to the client's event loop, which performs the
/// network write the next time it is polled.
#[derive(Clone)]
pub struct MqttClientPublisher {
    client: AsyncClient,
}

impl MqttClientPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MqttPublisher for MqttClientPublisher {
    async fn publish(&self, topic: String, qos: QoS, payload: Bytes) -> anyhow::Result<()> {
        self.client
            .publish_bytes(topic.as_str(), qos, false, payload)
            .await
            .with_context(|| format!("Failed to publish to MQTT topic '{}'", topic))
    }
}
