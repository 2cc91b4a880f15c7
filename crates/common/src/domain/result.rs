use thiserror::Error;

pub type DetectionResult<T> = Result<T, DetectionError>;

/// Result code reported alongside a successful analysis.
pub const ANALYSIS_OK: i32 = 0;

/// Result code reported alongside any failed analysis.
pub const ANALYSIS_FAILED: i32 = -1;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Failed to decode image payload: {0}")]
    Decode(String),

    #[error("Analyzer unavailable: {0}")]
    AnalyzerUnavailable(String),

    #[error("Failed to parse analyzer response as JSON: {message}")]
    ResponseParse {
        message: String,
        raw_response: String,
    },

    #[error("Analyzer backend error: {0}")]
    Backend(String),

    #[error("Broker transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DetectionError {
    /// Diagnostic result code; every failure maps to [`ANALYSIS_FAILED`].
    pub fn result_code(&self) -> i32 {
        ANALYSIS_FAILED
    }

    /// Short, stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::Decode(_) => "decode_error",
            DetectionError::AnalyzerUnavailable(_) => "analyzer_unavailable",
            DetectionError::ResponseParse { .. } => "response_parse_error",
            DetectionError::Backend(_) => "backend_error",
            DetectionError::Transport(_) => "transport_error",
            DetectionError::Serialization(_) => "serialization_error",
        }
    }
}
