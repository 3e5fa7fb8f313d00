//! Calibration pipeline: score the validation set, compute per-class
//! thresholds and merge them into the app config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::backend::Backend,
};
use clap::Parser;
use tracing::{info, warn};

use crate::calibration::{
    CalibrationPolicy, ConfidenceCollector, PerClassThresholds, DEFAULT_FALLBACK_THRESHOLD,
    DEFAULT_PERCENTILE,
};
use crate::error::FiskError;
use crate::ml::dataset::{discover_classes, ImageBatch, ImageBatcher, ImageFolderDataset};
use crate::ml::InferenceEngine;
use crate::model::{
    log_metadata_info, threshold_config::DEFAULT_CONFIG_PATH, CalibrationSettings, ThresholdConfig,
};
use crate::TrainBackend;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "calibrate",
    about = "Compute per-class confidence thresholds and merge them into the app config"
)]
pub struct CalibrateArgs {
    /// Validation dataset root (class subfolders).
    #[arg(long = "val_dir")]
    pub val_dir: PathBuf,
    /// Full-precision model archive written by `train`.
    #[arg(long = "model", default_value = "training/outputs/model.tar.gz")]
    pub model: PathBuf,
    #[arg(long = "img_size", default_value_t = 224)]
    pub img_size: usize,
    #[arg(long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,
    /// Percentile of correct confidences to use per class.
    #[arg(long = "percentile", default_value_t = DEFAULT_PERCENTILE)]
    pub percentile: f64,
    #[arg(long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    /// Threshold for classes with no correct prediction.
    #[arg(long = "fallback_threshold", default_value_t = DEFAULT_FALLBACK_THRESHOLD)]
    pub fallback_threshold: f64,
}

impl From<CalibrateArgs> for CalibrationSettings {
    fn from(args: CalibrateArgs) -> Self {
        Self {
            val_dir: args.val_dir,
            model: args.model,
            img_size: args.img_size,
            batch_size: args.batch_size,
            percentile: args.percentile,
            config: args.config,
            fallback_threshold: args.fallback_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub thresholds: PerClassThresholds,
    pub config_path: PathBuf,
    pub samples: usize,
    pub correct: usize,
}

/// Score every validation image in order and keep the confidences of correct predictions.
pub fn collect_confidences<B: Backend>(
    engine: &InferenceEngine<B>,
    dataset: &ImageFolderDataset,
    image_size: usize,
    batch_size: usize,
) -> Result<(ConfidenceCollector, usize)> {
    let mut collector = ConfidenceCollector::new(dataset.class_names().to_vec());
    let num_outputs = engine.num_outputs();
    if num_outputs == 1 {
        warn!("model has a single output; skipping calibration, every class gets the fallback");
        return Ok((collector, 0));
    }

    let batcher = ImageBatcher::new(image_size);
    let mut correct = 0;
    for chunk in dataset.samples().chunks(batch_size.max(1)) {
        let batch: ImageBatch<B> =
            Batcher::<B, _, _>::batch(&batcher, chunk.to_vec(), engine.device());
        let probs = engine.predict_batch(batch.images)?;
        correct += collector.observe_batch(&probs, num_outputs, &batch.labels);
    }
    Ok((collector, correct))
}

/// Load `val_dir` in the model's label order.
///
/// Model classes without a folder get no samples (and so the fallback); a
/// folder the model does not know is a label mismatch.
fn load_validation_set(val_dir: &Path, class_labels: &[String]) -> Result<ImageFolderDataset> {
    let found = discover_classes(val_dir)
        .with_context(|| format!("failed to load validation set {}", val_dir.display()))?;
    if found.iter().any(|name| !class_labels.contains(name)) {
        return Err(FiskError::LabelMismatch {
            expected: class_labels.to_vec(),
            found,
        }
        .into());
    }
    for name in class_labels.iter().filter(|name| !found.contains(name)) {
        warn!("no validation folder for class {name}; it gets the fallback threshold");
    }
    ImageFolderDataset::from_directory_with_order(val_dir, class_labels)
        .with_context(|| format!("failed to load validation set {}", val_dir.display()))
}

/// Run the calibration pipeline end to end.
pub fn run_calibration(settings: &CalibrationSettings) -> Result<CalibrationReport> {
    let policy: CalibrationPolicy = settings.policy()?;

    let device = <TrainBackend as Backend>::Device::default();
    let engine = InferenceEngine::<TrainBackend>::load(&settings.model, &device)
        .with_context(|| format!("failed to load model {}", settings.model.display()))?;
    log_metadata_info(engine.metadata());
    if engine.metadata().img_size() != settings.img_size {
        warn!(
            "model was trained at {}px, calibrating at {}px",
            engine.metadata().img_size(),
            settings.img_size
        );
    }

    let dataset = load_validation_set(&settings.val_dir, engine.class_labels())?;
    info!("scoring {} validation images", dataset.len());

    let (collector, correct) =
        collect_confidences(&engine, &dataset, settings.img_size, settings.batch_size)?;
    info!("{correct} of {} images classified correctly", collector.observed());
    let thresholds = collector.thresholds(&policy);

    let mut config = ThresholdConfig::load(&settings.config)?;
    config.merge(&thresholds)?;
    config.save()?;
    info!("thresholds written to {}", settings.config.display());

    Ok(CalibrationReport {
        thresholds,
        config_path: settings.config.clone(),
        samples: dataset.len(),
        correct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_flags() {
        let args = CalibrateArgs::try_parse_from(["calibrate", "--val_dir", "val"]).unwrap();
        let settings = CalibrationSettings::from(args);
        assert_eq!(settings, CalibrationSettings { val_dir: "val".into(), ..Default::default() });
    }

    #[test]
    fn val_dir_is_required() {
        assert!(CalibrateArgs::try_parse_from(["calibrate"]).is_err());
    }

    #[test]
    fn invalid_percentile_fails_before_loading_anything() {
        let settings = CalibrationSettings {
            val_dir: "missing".into(),
            percentile: 1.5,
            ..Default::default()
        };
        let err = run_calibration(&settings).unwrap_err();
        assert!(err.to_string().contains("percentile"));
    }
}
