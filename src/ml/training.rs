//! Two-phase training: frozen-backbone warmup, then fine-tuning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::DataLoader, dataloader::DataLoaderBuilder, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::calibration::argmax;
use crate::ml::callbacks::{BestCheckpoint, EarlyStopping, EpochAction, PhaseCallbacks, ReduceLrOnPlateau};
use crate::ml::dataset::{discover_classes, ImageBatch, ImageBatcher, ImageFolderDataset};
use crate::ml::export::{export_model, ExportReport};
use crate::ml::{FishClassifier, ModelConfig};
use crate::model::{
    write_labels, DatasetSource, ModelMetadata, TrainingSettings, LABELS_FILE_NAME,
    TRAIN_CONFIG_FILE_NAME,
};
use crate::{TrainAutodiff, TrainBackend};

pub const CHECKPOINT_NAME: &str = "checkpoint";
pub const HISTORY_FILE_NAME: &str = "history.csv";

const EARLY_STOPPING_PATIENCE: usize = 5;
const PLATEAU_FACTOR: f64 = 0.5;
const PLATEAU_PATIENCE: usize = 2;

#[derive(Parser, Debug, Clone)]
#[command(name = "train", about = "Train fish classifier and export the model archives")]
pub struct TrainArgs {
    /// Path to dataset root. Expect class subfolders.
    #[arg(long = "data_dir")]
    pub data_dir: Option<PathBuf>,
    /// Path to training dataset root (class subfolders).
    #[arg(long = "train_dir")]
    pub train_dir: Option<PathBuf>,
    /// Path to validation dataset root (class subfolders).
    #[arg(long = "val_dir")]
    pub val_dir: Option<PathBuf>,
    /// Directory to write outputs.
    #[arg(long = "output_dir", default_value = "models")]
    pub output_dir: PathBuf,
    #[arg(long = "img_size", default_value_t = 224)]
    pub img_size: usize,
    #[arg(long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,
    #[arg(long = "epochs", default_value_t = 10)]
    pub epochs: usize,
    #[arg(long = "val_split", default_value_t = 0.2)]
    pub val_split: f32,
    /// Unfreeze the last N backbone blocks for fine-tuning.
    #[arg(long = "fine_tune_layers", default_value_t = 30)]
    pub fine_tune_layers: usize,
    /// Seed for the train/validation split and batch shuffling.
    #[arg(long = "seed", default_value_t = 1337)]
    pub seed: u64,
    #[arg(long = "learning_rate", default_value_t = 1e-3)]
    pub learning_rate: f64,
    /// Data loader worker threads.
    #[arg(long = "num_workers", default_value_t = 2)]
    pub num_workers: usize,
    /// Pretrained backbone record (.mpk). Random init when omitted.
    #[arg(long = "backbone_weights")]
    pub backbone_weights: Option<PathBuf>,
}

impl From<TrainArgs> for TrainingSettings {
    fn from(args: TrainArgs) -> Self {
        Self {
            data_dir: args.data_dir,
            train_dir: args.train_dir,
            val_dir: args.val_dir,
            output_dir: args.output_dir,
            img_size: args.img_size,
            batch_size: args.batch_size,
            epochs: args.epochs,
            val_split: args.val_split,
            fine_tune_layers: args.fine_tune_layers,
            seed: args.seed,
            learning_rate: args.learning_rate,
            num_workers: args.num_workers,
            backbone_weights: args.backbone_weights,
        }
    }
}

/// One row of `history.csv`.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub phase: &'static str,
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub class_names: Vec<String>,
    pub labels_path: PathBuf,
    pub head_epochs: usize,
    pub fine_tune_epochs: usize,
    pub best_val_accuracy: Option<f64>,
    pub export: ExportReport,
}

/// Running loss/accuracy over one pass.
#[derive(Debug, Default, Clone)]
struct EpochStats {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl EpochStats {
    fn record<B: Backend>(
        &mut self,
        loss: Tensor<B, 1>,
        logits: Tensor<B, 2>,
        labels: &[usize],
    ) -> Result<()> {
        let loss = tensor_values(loss)?.first().copied().unwrap_or(f32::NAN);
        let [_, num_outputs] = logits.dims();
        let logits = tensor_values(logits)?;

        self.loss_sum += f64::from(loss) * labels.len() as f64;
        self.total += labels.len();
        self.correct += logits
            .chunks_exact(num_outputs.max(1))
            .zip(labels)
            .filter(|(row, label)| predicted_label(row) == Some(**label))
            .count();
        Ok(())
    }

    fn loss(&self) -> f64 {
        if self.total == 0 {
            f64::NAN
        } else {
            self.loss_sum / self.total as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Class predicted from one logit row; a single logit predicts class 1 above zero.
fn predicted_label(row: &[f32]) -> Option<usize> {
    match row {
        [logit] => Some(usize::from(*logit > 0.0)),
        _ => argmax(row),
    }
}

fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read tensor data: {e:?}"))
}

/// Backbone blocks kept frozen in the fine-tune phase.
pub fn frozen_blocks_for_fine_tune(total_blocks: usize, fine_tune_layers: usize) -> usize {
    total_blocks - fine_tune_layers.min(total_blocks)
}

/// Callbacks every phase starts with.
fn phase_callbacks<M: Clone>() -> PhaseCallbacks<M> {
    PhaseCallbacks::new(
        EarlyStopping::new(EARLY_STOPPING_PATIENCE, 0.0),
        ReduceLrOnPlateau::new(PLATEAU_FACTOR, PLATEAU_PATIENCE),
    )
}

struct PhasePlan {
    name: &'static str,
    epochs: usize,
    learning_rate: f64,
    frozen_blocks: usize,
}

type TrainLoader = Arc<dyn DataLoader<TrainAutodiff, ImageBatch<TrainAutodiff>>>;
type ValidLoader = Arc<dyn DataLoader<TrainBackend, ImageBatch<TrainBackend>>>;

struct Trainer {
    train_loader: TrainLoader,
    valid_loader: ValidLoader,
    checkpoint: BestCheckpoint,
    checkpoint_path: PathBuf,
    history: csv::Writer<std::fs::File>,
}

impl Trainer {
    /// Train one phase and return the model plus the number of epochs run.
    fn run_phase(
        &mut self,
        mut model: FishClassifier<TrainAutodiff>,
        plan: &PhasePlan,
    ) -> Result<(FishClassifier<TrainAutodiff>, usize)> {
        info!(
            "phase {}: up to {} epochs, lr {:.1e}, {} of {} backbone blocks frozen",
            plan.name,
            plan.epochs,
            plan.learning_rate,
            plan.frozen_blocks,
            model.num_backbone_blocks()
        );

        let mut optim = AdamConfig::new().init();
        let mut callbacks = phase_callbacks();
        let mut lr = plan.learning_rate;
        let mut epochs_run = 0;

        for epoch in 1..=plan.epochs {
            epochs_run = epoch;

            let mut train_stats = EpochStats::default();
            for batch in self.train_loader.iter() {
                let output =
                    model.forward_classification(batch.images, batch.targets, plan.frozen_blocks);
                train_stats.record(output.loss.clone(), output.output, &batch.labels)?;
                let grads = GradientsParams::from_grads(output.loss.backward(), &model);
                model = optim.step(lr, model, grads);
            }

            let valid_model = model.valid();
            let mut val_stats = EpochStats::default();
            for batch in self.valid_loader.iter() {
                let output = valid_model.forward_classification(batch.images, batch.targets, 0);
                val_stats.record(output.loss, output.output, &batch.labels)?;
            }

            let record = EpochRecord {
                phase: plan.name,
                epoch,
                train_loss: train_stats.loss(),
                train_accuracy: train_stats.accuracy(),
                val_loss: val_stats.loss(),
                val_accuracy: val_stats.accuracy(),
                learning_rate: lr,
            };
            info!(
                "[{}] epoch {}/{}: loss {:.4} acc {:.4} | val_loss {:.4} val_acc {:.4} | lr {:.2e}",
                plan.name,
                epoch,
                plan.epochs,
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy,
                lr
            );
            self.history.serialize(&record)?;
            self.history.flush()?;

            if self.checkpoint.improved(record.val_accuracy) {
                model
                    .clone()
                    .save_file(
                        &self.checkpoint_path,
                        &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                    )
                    .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e:?}"))?;
                info!("val_accuracy improved to {:.4}, checkpoint saved", record.val_accuracy);
            }

            match callbacks.on_epoch_end(epoch, record.val_loss, lr, &model) {
                EpochAction::Continue { lr: next } => lr = next,
                EpochAction::Stop {
                    restore,
                    best_epoch,
                } => {
                    if let Some(best) = restore {
                        info!("restoring weights from epoch {}", best_epoch.unwrap_or(epoch));
                        model = best;
                    }
                    break;
                }
            }
        }

        Ok((model, epochs_run))
    }
}

fn load_datasets(
    source: &DatasetSource,
    settings: &TrainingSettings,
) -> Result<(ImageFolderDataset, ImageFolderDataset)> {
    match source {
        DatasetSource::Split { data_dir } => {
            let dataset = ImageFolderDataset::from_directory(data_dir)
                .with_context(|| format!("failed to load dataset {}", data_dir.display()))?;
            Ok(dataset.split(settings.val_split, settings.seed)?)
        }
        DatasetSource::Separate { train_dir, val_dir } => {
            let class_names = discover_classes(train_dir)
                .with_context(|| format!("no class folders found in train dir {}", train_dir.display()))?;
            let train = ImageFolderDataset::from_directory_with_order(train_dir, &class_names)?;
            let val = ImageFolderDataset::from_directory_with_order(val_dir, &class_names)?;
            Ok((train, val))
        }
    }
}

fn load_backbone_weights(
    model: FishClassifier<TrainAutodiff>,
    path: Option<&Path>,
    device: &<TrainAutodiff as Backend>::Device,
) -> Result<FishClassifier<TrainAutodiff>> {
    let Some(path) = path else {
        warn!("no --backbone_weights given, backbone starts from random initialization");
        return Ok(model);
    };
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let backbone = model
        .backbone
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load backbone weights {}: {e:?}", path.display()))?;
    info!("loaded backbone weights from {}", path.display());
    Ok(FishClassifier {
        backbone,
        head: model.head,
    })
}

/// Run the full training pipeline and export the artifacts.
pub fn run_training(settings: &TrainingSettings) -> Result<TrainingReport> {
    let source = settings.dataset_source()?;
    let output_dir = &settings.output_dir;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;

    let (train_set, val_set) = load_datasets(&source, settings)?;
    let class_names = train_set.class_names().to_vec();
    info!("Found {} classes: {:?}", class_names.len(), class_names);
    for (name, (train, val)) in class_names
        .iter()
        .zip(train_set.class_counts().into_iter().zip(val_set.class_counts()))
    {
        info!("  {name}: {train} train / {val} val");
    }
    info!("train images: {}, val images: {}", train_set.len(), val_set.len());

    let labels_path = output_dir.join(LABELS_FILE_NAME);
    write_labels(&labels_path, &class_names)?;
    settings.save(output_dir.join(TRAIN_CONFIG_FILE_NAME))?;

    let device = <TrainAutodiff as Backend>::Device::default();
    let model_config = ModelConfig::new(class_names.len()).with_image_size(settings.img_size);
    let model = model_config.init::<TrainAutodiff>(&device);
    let model = load_backbone_weights(model, settings.backbone_weights.as_deref(), &device)?;
    let total_blocks = model.num_backbone_blocks();

    let train_loader: TrainLoader = DataLoaderBuilder::new(ImageBatcher::new(settings.img_size))
        .batch_size(settings.batch_size.max(1))
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(train_set);
    let valid_loader: ValidLoader = DataLoaderBuilder::new(ImageBatcher::new(settings.img_size))
        .batch_size(settings.batch_size.max(1))
        .num_workers(settings.num_workers)
        .build(val_set);

    let history_path = output_dir.join(HISTORY_FILE_NAME);
    let mut trainer = Trainer {
        train_loader,
        valid_loader,
        checkpoint: BestCheckpoint::default(),
        checkpoint_path: output_dir.join(CHECKPOINT_NAME),
        history: csv::Writer::from_path(&history_path)
            .with_context(|| format!("failed to create {}", history_path.display()))?,
    };

    let head_plan = PhasePlan {
        name: "head",
        epochs: settings.epochs,
        learning_rate: settings.learning_rate,
        frozen_blocks: total_blocks,
    };
    let (model, head_epochs) = trainer.run_phase(model, &head_plan)?;

    let fine_tune_plan = PhasePlan {
        name: "fine_tune",
        epochs: settings.fine_tune_epochs(),
        learning_rate: settings.fine_tune_learning_rate(),
        frozen_blocks: frozen_blocks_for_fine_tune(total_blocks, settings.fine_tune_layers),
    };
    let (model, fine_tune_epochs) = trainer.run_phase(model, &fine_tune_plan)?;

    let best_val_accuracy = trainer.checkpoint.best();
    let metadata = ModelMetadata::new(
        class_names.clone(),
        model_config,
        head_epochs,
        fine_tune_epochs,
        best_val_accuracy,
    );
    let export = export_model(&model.valid(), &metadata, output_dir)?;
    info!("Saved: {}", labels_path.display());
    info!("Training complete.");

    Ok(TrainingReport {
        class_names,
        labels_path,
        head_epochs,
        fine_tune_epochs,
        best_val_accuracy,
        export,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fine_tune_freezes_earliest_blocks() {
        assert_eq!(frozen_blocks_for_fine_tune(5, 30), 0);
        assert_eq!(frozen_blocks_for_fine_tune(5, 2), 3);
        assert_eq!(frozen_blocks_for_fine_tune(5, 0), 5);
    }

    fn logits(model: &FishClassifier<TrainAutodiff>) -> Vec<f32> {
        let images = Tensor::<TrainBackend, 4>::ones([1, 3, 16, 16], &Default::default());
        tensor_values(model.valid().forward(images)).unwrap()
    }

    #[test]
    fn early_stop_restores_best_model_weights() {
        let device = Default::default();
        let config = ModelConfig::new(3).with_image_size(16);
        let best = config.init::<TrainAutodiff>(&device);
        let later = config.init::<TrainAutodiff>(&device);
        assert_ne!(logits(&best), logits(&later));

        let mut callbacks = phase_callbacks();
        let mut model = best.clone();
        let mut restored_at = None;
        for epoch in 1..=20 {
            let val_loss = if epoch == 1 { 0.5 } else { 0.5 + epoch as f64 };
            match callbacks.on_epoch_end(epoch, val_loss, 1e-3, &model) {
                EpochAction::Continue { .. } => model = later.clone(),
                EpochAction::Stop { restore, best_epoch } => {
                    assert_eq!(best_epoch, Some(1));
                    model = restore.unwrap();
                    restored_at = Some(epoch);
                    break;
                }
            }
        }
        assert_eq!(restored_at, Some(1 + EARLY_STOPPING_PATIENCE));
        assert_eq!(logits(&model), logits(&best));
    }

    #[test]
    fn single_logit_predicts_positive_above_zero() {
        assert_eq!(predicted_label(&[-0.3]), Some(0));
        assert_eq!(predicted_label(&[0.7]), Some(1));
        assert_eq!(predicted_label(&[0.1, 0.9, 0.0]), Some(1));
    }

    #[test]
    fn cli_flags_use_snake_case_and_defaults() {
        let args = TrainArgs::try_parse_from(["train", "--data_dir", "fish", "--epochs", "4"]).unwrap();
        let settings = TrainingSettings::from(args);
        assert_eq!(settings.data_dir, Some(PathBuf::from("fish")));
        assert_eq!(settings.epochs, 4);
        assert_eq!(settings.img_size, 224);
        assert_eq!(settings.output_dir, PathBuf::from("models"));
        assert_eq!(settings.fine_tune_layers, 30);
    }

    #[test]
    fn missing_dataset_flags_are_a_usage_error() {
        let args = TrainArgs::try_parse_from(["train", "--train_dir", "t"]).unwrap();
        let err = run_training(&TrainingSettings::from(args)).unwrap_err();
        assert!(err.to_string().contains("--data_dir"));
    }
}
