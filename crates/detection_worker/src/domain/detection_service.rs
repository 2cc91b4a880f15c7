use crate::domain::{decode_image_payload, MedicineAnalyzer};
use bytes::Bytes;
use common::domain::{DetectionProducer, DetectionResult, MedicineDetection};
use std::sync::Arc;
use tracing::{debug, instrument};

/// An image message as received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl ImageMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: chrono::Utc::now(),
        }
    }

    /// Milliseconds since the message was read off the broker connection
    pub fn elapsed_ms(&self) -> i64 {
        (chrono::Utc::now() - self.received_at).num_milliseconds()
    }
}

/// Domain service that turns an image message into a published detection
///
/// Flow:
/// 1. Decode the base64 payload into an image
/// 2. Analyze the image with the vision model
/// 3. Stamp the result with the current UTC time
/// 4. Publish via producer trait
///
/// Any failure stops the flow; nothing is published for that message.
pub struct DetectionService {
    analyzer: MedicineAnalyzer,
    producer: Arc<dyn DetectionProducer>,
}

impl DetectionService {
    pub fn new(analyzer: MedicineAnalyzer, producer: Arc<dyn DetectionProducer>) -> Self {
        Self { analyzer, producer }
    }

    #[instrument(skip_all, fields(topic = %message.topic, payload_size = message.payload.len()))]
    pub async fn process_image_message(
        &self,
        message: &ImageMessage,
    ) -> DetectionResult<MedicineDetection> {
        let image = decode_image_payload(&message.payload)?;
        debug!(
            format = ?image.format(),
            width = image.width(),
            height = image.height(),
            "decoded image payload"
        );

        let info = self.analyzer.analyze(&image).await?;

        let detection = MedicineDetection::new(info, chrono::Utc::now());
        self.producer.publish(&detection).await?;

        debug!(
            unrecognized = detection.info.is_unrecognized(),
            "published detection"
        );

        Ok(detection)
    }
}
