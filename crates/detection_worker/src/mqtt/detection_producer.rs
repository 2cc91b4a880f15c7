use async_trait::async_trait;
use bytes::Bytes;
use common::domain::{
    DetectionError, DetectionProducer as DetectionProducerTrait, DetectionResult,
    MedicineDetection,
};
use common::mqtt::MqttPublisher;
use rumqttc::QoS;
use std::sync::Arc;
use tracing::{debug, info};

/// MQTT producer that publishes detections as JSON on the output topic
pub struct MqttDetectionProducer {
    publisher: Arc<dyn MqttPublisher>,
    topic: String,
    qos: QoS,
}

impl MqttDetectionProducer {
    pub fn new(publisher: Arc<dyn MqttPublisher>, topic: String, qos: QoS) -> Self {
        info!("Created MqttDetectionProducer for topic: {}", topic);
        Self {
            publisher,
            topic,
            qos,
        }
    }
}

#[async_trait]
impl DetectionProducerTrait for MqttDetectionProducer {
    async fn publish(&self, detection: &MedicineDetection) -> DetectionResult<()> {
        let payload = serde_json::to_vec(detection)?;

        debug!(
            topic = %self.topic,
            size_bytes = payload.len(),
            "Publishing detection"
        );

        self.publisher
            .publish(self.topic.clone(), self.qos, Bytes::from(payload))
            .await
            .map_err(DetectionError::Transport)?;

        info!(
            topic = %self.topic,
            name = detection.info.name.as_deref().unwrap_or_default(),
            "Successfully published detection"
        );

        Ok(())
    }
}
