//! Training and calibration settings.
//!
//! Both structs mirror their command-line flags and carry the same defaults.
//! The training settings are written next to the trained model so a run can
//! be reproduced later.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::calibration::{CalibrationPolicy, DEFAULT_FALLBACK_THRESHOLD, DEFAULT_PERCENTILE};
use crate::error::{FiskError, FiskResult};

pub const TRAIN_CONFIG_FILE_NAME: &str = "train_config.json";

/// Where the training and validation images come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// One root, split into train/validation with a fixed seed.
    Split { data_dir: PathBuf },
    /// Separate roots; the class order comes from `train_dir`.
    Separate { train_dir: PathBuf, val_dir: PathBuf },
}

/// Training settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    pub data_dir: Option<PathBuf>,
    pub train_dir: Option<PathBuf>,
    pub val_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Square input resolution fed to the network
    pub img_size: usize,
    pub batch_size: usize,
    /// Upper bound for the frozen-backbone phase
    pub epochs: usize,
    pub val_split: f32,
    /// Backbone blocks re-enabled for the fine-tune phase
    pub fine_tune_layers: usize,
    pub seed: u64,
    pub learning_rate: f64,
    pub num_workers: usize,
    /// Optional pretrained backbone record
    pub backbone_weights: Option<PathBuf>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            train_dir: None,
            val_dir: None,
            output_dir: PathBuf::from("models"),
            img_size: 224,
            batch_size: 32,
            epochs: 10,
            val_split: 0.2,
            fine_tune_layers: 30,
            seed: 1337,
            learning_rate: 1e-3,
            num_workers: 2,
            backbone_weights: None,
        }
    }
}

impl TrainingSettings {
    /// Resolve the dataset mode. Paired train/val roots win over `data_dir`.
    pub fn dataset_source(&self) -> FiskResult<DatasetSource> {
        match (&self.train_dir, &self.val_dir, &self.data_dir) {
            (Some(train_dir), Some(val_dir), _) => Ok(DatasetSource::Separate {
                train_dir: train_dir.clone(),
                val_dir: val_dir.clone(),
            }),
            (_, _, Some(data_dir)) => Ok(DatasetSource::Split {
                data_dir: data_dir.clone(),
            }),
            _ => Err(FiskError::Usage(
                "Provide either --data_dir or both --train_dir and --val_dir".to_string(),
            )),
        }
    }

    pub fn fine_tune_epochs(&self) -> usize {
        (self.epochs / 2).max(3)
    }

    pub fn fine_tune_learning_rate(&self) -> f64 {
        self.learning_rate / 10.0
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> FiskResult<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).map_err(|source| FiskError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(|e| FiskError::io(path, e))
    }
}

/// Calibration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationSettings {
    pub val_dir: PathBuf,
    /// Full-precision model archive written by the trainer
    pub model: PathBuf,
    pub img_size: usize,
    pub batch_size: usize,
    pub percentile: f64,
    /// App config that receives the thresholds
    pub config: PathBuf,
    pub fallback_threshold: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            val_dir: PathBuf::new(),
            model: PathBuf::from("training/outputs/model.tar.gz"),
            img_size: 224,
            batch_size: 32,
            percentile: DEFAULT_PERCENTILE,
            config: PathBuf::from(crate::model::threshold_config::DEFAULT_CONFIG_PATH),
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
        }
    }
}

impl CalibrationSettings {
    pub fn policy(&self) -> FiskResult<CalibrationPolicy> {
        CalibrationPolicy::new(self.percentile, self.fallback_threshold)
    }
}
