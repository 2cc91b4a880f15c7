use crate::domain::{DecodedImage, VisionModel};
use common::domain::{DetectionError, DetectionResult, MedicineInfo};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

const NAME_KEY: &str = "Nama_Obat";
const FUNCTION_KEY: &str = "Fungsi_Obat";
const USAGE_KEY: &str = "Cara_penggunaan";

/// Instruction sent with every image. The model must answer with a JSON
/// object holding exactly the three keys above, or all `"0"` when the image
/// does not show a known medicine.
pub const MEDICINE_PROMPT: &str = r#"Kamu diberikan gambar kemasan obat atau nama obat itu sendiri. Tugasmu adalah menganalisis gambar tersebut dan memberikan informasi berikut dalam format JSON **valid**:

- "Nama_Obat": Nama obat yang terlihat di gambar.
- "Fungsi_Obat": Fungsi utama obat tersebut (misalnya: meredakan demam, mengobati infeksi, dll.) dibatasi 1 kalimat dan diringkas maksimal 5 kata saja.
- "Cara_penggunaan": Cara penggunaan umum berdasarkan informasi di internet (misal: diminum 2x sehari, diminum 3x sehari, dll.), rangkum jadi 20 huruf.

Jika nama obat tidak ada di internet atau tidak valid, isi ketiga field dengan string "0".

Contoh output yang valid:
{
    "Nama_Obat": "Paracetamol",
    "Fungsi_Obat": "demam dan nyeri",
    "Cara_penggunaan": "3-4 kali sehari"
}
Contoh output yang valid lainnya:
{
    "Nama_Obat": "Lodia",
    "Fungsi_Obat": "Diare akut dan kronis",
    "Cara_penggunaan": "2 kali sehari"
}
Contoh output yang valid lainnya:
{
    "Nama_Obat": "Demacolin",
    "Fungsi_Obat": "Pilek dan flu berdahak",
    "Cara_penggunaan": "3 kali sehari"
}
Contoh output jika nama obat tidak valid atau tidak ada dalam internet:
{
    "Nama_Obat": "0",
    "Fungsi_Obat": "0",
    "Cara_penggunaan": "0"
}

Hanya berikan output dalam format JSON. Jangan menambahkan penjelasan atau teks lain."#;

/// Turns an image into a [`MedicineInfo`] by prompting a vision model and
/// parsing its answer.
///
/// Built without a model when the backend could not be configured; every
/// call then fails with `AnalyzerUnavailable` without any network I/O.
pub struct MedicineAnalyzer {
    model: Option<Arc<dyn VisionModel>>,
}

impl MedicineAnalyzer {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn unavailable() -> Self {
        Self { model: None }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    #[instrument(
        skip_all,
        fields(
            image_format = ?image.format(),
            width = image.width(),
            height = image.height(),
        )
    )]
    pub async fn analyze(&self, image: &DecodedImage) -> DetectionResult<MedicineInfo> {
        let Some(model) = &self.model else {
            return Err(DetectionError::AnalyzerUnavailable(
                "vision model is not configured".to_string(),
            ));
        };

        let response = model.generate(MEDICINE_PROMPT, image).await?;
        debug!(response_len = response.len(), "received vision model response");

        parse_analysis_response(&response)
    }
}

/// Remove a surrounding markdown code fence (```` ```json ```` or ```` ``` ````)
/// and outer whitespace. Applying it to its own output changes nothing.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let without_prefix = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let without_suffix = without_prefix
        .strip_suffix("```")
        .unwrap_or(without_prefix);
    without_suffix.trim()
}

/// Parse the model's raw text into a [`MedicineInfo`]
///
/// Missing keys become `None`; the text must otherwise be a JSON object.
pub fn parse_analysis_response(raw: &str) -> DetectionResult<MedicineInfo> {
    let parse_error = |message: String| DetectionError::ResponseParse {
        message,
        raw_response: raw.to_string(),
    };

    let value: Value =
        serde_json::from_str(strip_code_fence(raw)).map_err(|e| parse_error(e.to_string()))?;

    let fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(parse_error(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            )));
        }
    };

    Ok(MedicineInfo {
        name: field_text(&fields, NAME_KEY),
        function: field_text(&fields, FUNCTION_KEY),
        usage: field_text(&fields, USAGE_KEY),
    })
}

/// Scalars are kept as text so a numeric `0` still reads as the sentinel
fn field_text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
