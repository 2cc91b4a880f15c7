use crate::domain::result::DetectionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// In-band value the model returns for every field when the image does not
/// show a recognizable medicine.
pub const UNRECOGNIZED_SENTINEL: &str = "0";

/// Structured answer extracted from the vision model.
///
/// Each field is optional: a key the model left out is `None` (published as
/// `null`), which is distinct from the `"0"` sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicineInfo {
    #[serde(rename = "Nama_Obat")]
    pub name: Option<String>,

    #[serde(rename = "Fungsi_Obat")]
    pub function: Option<String>,

    #[serde(rename = "Cara_penggunaan")]
    pub usage: Option<String>,
}

impl MedicineInfo {
    pub fn new(
        name: impl Into<String>,
        function: impl Into<String>,
        usage: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            function: Some(function.into()),
            usage: Some(usage.into()),
        }
    }

    /// The all-sentinel record for an unrecognized item
    pub fn unrecognized() -> Self {
        Self::new(
            UNRECOGNIZED_SENTINEL,
            UNRECOGNIZED_SENTINEL,
            UNRECOGNIZED_SENTINEL,
        )
    }

    pub fn is_unrecognized(&self) -> bool {
        [&self.name, &self.function, &self.usage]
            .iter()
            .all(|field| field.as_deref() == Some(UNRECOGNIZED_SENTINEL))
    }
}

/// A medicine analysis stamped with the time it was published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicineDetection {
    #[serde(flatten)]
    pub info: MedicineInfo,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl MedicineDetection {
    pub fn new(info: MedicineInfo, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        Self { info, timestamp }
    }
}

/// Trait for publishing detections to the message broker
///
/// Implementations should:
/// - Serialize the detection to JSON
/// - Publish it to the configured output topic
/// - Return error if the broker client rejects the publish
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DetectionProducer: Send + Sync {
    async fn publish(&self, detection: &MedicineDetection) -> DetectionResult<()>;
}
