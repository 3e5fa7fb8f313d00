//! Model metadata stored as `metadata.json` inside each model archive.

use serde::{Deserialize, Serialize};

use crate::ml::ModelConfig;

/// Numeric precision of the recorded weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WeightPrecision {
    Full,
    Half,
}

impl std::fmt::Display for WeightPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightPrecision::Full => write!(f, "f32"),
            WeightPrecision::Half => write!(f, "f16"),
        }
    }
}

/// Model metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Class names in output-index order
    pub class_labels: Vec<String>,

    /// Architecture needed to rebuild the module before loading weights
    pub model: ModelConfig,

    /// Epochs actually run in the frozen-backbone phase
    pub head_epochs: usize,

    /// Epochs actually run in the fine-tune phase
    pub fine_tune_epochs: usize,

    #[serde(default)]
    pub best_val_accuracy: Option<f64>,

    pub precision: WeightPrecision,

    /// RFC 3339 timestamp
    pub trained_at: String,
}

impl ModelMetadata {
    pub fn new(
        class_labels: Vec<String>,
        model: ModelConfig,
        head_epochs: usize,
        fine_tune_epochs: usize,
        best_val_accuracy: Option<f64>,
    ) -> Self {
        Self {
            class_labels,
            model,
            head_epochs,
            fine_tune_epochs,
            best_val_accuracy,
            precision: WeightPrecision::Full,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn with_precision(mut self, precision: WeightPrecision) -> Self {
        self.precision = precision;
        self
    }

    pub fn img_size(&self) -> usize {
        self.model.image_size
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_string(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
