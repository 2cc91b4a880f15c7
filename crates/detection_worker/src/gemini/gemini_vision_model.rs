use crate::domain::{DecodedImage, VisionModel};
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::domain::{DetectionError, DetectionResult};
use secrecy::{ExposeSecret, Secret};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Connection settings for the Gemini REST API
pub struct GeminiConfig {
    pub api_key: Secret<String>,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

/// [`VisionModel`] backed by Gemini's `generateContent` endpoint.
pub struct GeminiVisionModel {
    api_key: Secret<String>,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiVisionModel {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build Gemini HTTP client")?;

        Ok(Self {
            api_key: config.api_key,
            model: config.model.trim().trim_start_matches("models/").to_string(),
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

/// Single-turn request carrying the prompt and the image inline
fn build_request_body(prompt: &str, image: &DecodedImage) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": prompt },
                {
                    "inlineData": {
                        "mimeType": image.mime_type(),
                        "data": STANDARD.encode(image.bytes()),
                    }
                }
            ]
        }]
    })
}

/// Concatenate the text parts of the first candidate
fn extract_text(response: &Value) -> Option<String> {
    let parts = response["candidates"][0]["content"]["parts"].as_array()?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect();

    if texts.is_empty() {
        None
    } else {
        Some(texts.concat())
    }
}

/// Explain why a response carried no text (prompt block or finish reason)
fn missing_text_reason(response: &Value) -> String {
    if let Some(reason) = response["promptFeedback"]["blockReason"].as_str() {
        return format!("prompt blocked: {}", reason);
    }
    match response["candidates"][0]["finishReason"].as_str() {
        Some(reason) => format!("no text in response (finish reason: {})", reason),
        None => "no candidates in response".to_string(),
    }
}

#[async_trait]
impl VisionModel for GeminiVisionModel {
    async fn generate(&self, prompt: &str, image: &DecodedImage) -> DetectionResult<String> {
        let body = build_request_body(prompt, image);

        debug!(
            model = %self.model,
            mime_type = image.mime_type(),
            image_bytes = image.bytes().len(),
            "gemini generateContent request"
        );

        let http_resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DetectionError::Backend(format!("Gemini request failed: {}", e)))?;

        let status = http_resp.status();
        if !status.is_success() {
            let body_text = http_resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body_text, "gemini API error");
            return Err(DetectionError::Backend(format!(
                "Gemini API error HTTP {}: {}",
                status, body_text
            )));
        }

        let resp = http_resp.json::<Value>().await.map_err(|e| {
            DetectionError::Backend(format!("Gemini response was not valid JSON: {}", e))
        })?;
        trace!(response = %resp, "gemini raw response");

        extract_text(&resp).ok_or_else(|| DetectionError::Backend(missing_text_reason(&resp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decode_image_payload;
    use crate::domain::test_support::base64_test_image;
    use image::ImageFormat;
    use wiremock::{
        matchers::{body_partial_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    const GENERATE_PATH: &str = "/v1beta/models/gemini-2.5-flash:generateContent";

    fn create_model(base_url: &str) -> GeminiVisionModel {
        GeminiVisionModel::new(GeminiConfig {
            api_key: Secret::new("test-api-key".to_string()),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: base_url.to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn create_test_image() -> DecodedImage {
        decode_image_payload(base64_test_image(ImageFormat::Png).as_bytes()).unwrap()
    }

    fn text_response(text: &str) -> Value {
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP"
            }]
        })
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "```json\n{" }, { "text": "}\n```" }] }
            }]
        });

        assert_eq!(extract_text(&response).as_deref(), Some("```json\n{}\n```"));
    }

    #[test]
    fn test_extract_text_none_without_candidates() {
        assert_eq!(extract_text(&json!({})), None);
        assert_eq!(missing_text_reason(&json!({})), "no candidates in response");
    }

    #[test]
    fn test_missing_text_reason_reports_block() {
        let response = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert_eq!(missing_text_reason(&response), "prompt blocked: SAFETY");
    }

    #[test]
    fn test_new_normalizes_model_and_base_url() {
        let model = GeminiVisionModel::new(GeminiConfig {
            api_key: Secret::new("k".to_string()),
            model: "models/gemini-2.5-flash".to_string(),
            base_url: "https://example.test/".to_string(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap();

        assert_eq!(model.model(), "gemini-2.5-flash");
        assert_eq!(
            model.endpoint(),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn test_generate_sends_prompt_and_inline_image() {
        let mock_server = MockServer::start().await;
        let image = create_test_image();

        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(header("x-goog-api-key", "test-api-key"))
            .and(body_partial_json(json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        { "text": "describe" },
                        { "inlineData": {
                            "mimeType": "image/png",
                            "data": STANDARD.encode(image.bytes()),
                        } }
                    ]
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_response("{}")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let model = create_model(&mock_server.uri());

        let text = model.generate("describe", &image).await.unwrap();
        assert_eq!(text, "{}");
    }

    #[tokio::test]
    async fn test_generate_maps_http_error_to_backend_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_string(r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED"}}"#),
            )
            .mount(&mock_server)
            .await;

        let model = create_model(&mock_server.uri());

        let result = model.generate("describe", &create_test_image()).await;

        match result {
            Err(DetectionError::Backend(message)) => {
                assert!(message.contains("429"));
                assert!(message.contains("RESOURCE_EXHAUSTED"));
            }
            other => panic!("expected Backend error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_reports_blocked_prompt() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "promptFeedback": { "blockReason": "SAFETY" }
            })))
            .mount(&mock_server)
            .await;

        let model = create_model(&mock_server.uri());

        let result = model.generate("describe", &create_test_image()).await;
        assert!(matches!(result, Err(DetectionError::Backend(msg)) if msg.contains("SAFETY")));
    }

    #[tokio::test]
    async fn test_generate_maps_connection_failure_to_backend_error() {
        // Nothing listens on the discard port
        let model = create_model("http://127.0.0.1:9");

        let result = model.generate("describe", &create_test_image()).await;
        assert!(matches!(result, Err(DetectionError::Backend(_))));
    }
}
