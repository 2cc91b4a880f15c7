use crate::domain::DecodedImage;
use async_trait::async_trait;
use common::domain::DetectionResult;

/// A multimodal model that answers a text prompt about an image
///
/// Implementations should:
/// - Send the prompt and image in a single request
/// - Return the model's free-form text answer unmodified
/// - Map transport and API failures to `DetectionError::Backend`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, prompt: &str, image: &DecodedImage) -> DetectionResult<String>;
}
