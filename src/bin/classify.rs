use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use fisk_trainer::calibration::DEFAULT_FALLBACK_THRESHOLD;
use fisk_trainer::ml::InferenceEngine;
use fisk_trainer::model::ThresholdConfig;
use fisk_trainer::TrainBackend;

#[derive(Parser, Debug)]
#[command(
    name = "classify",
    about = "Classify images with an exported model and apply the calibrated thresholds"
)]
struct Args {
    /// Model archive (full or half precision).
    #[arg(long = "model", default_value = "models/fish_model.tar.gz")]
    model: PathBuf,
    /// Threshold config; without it every class uses the fallback threshold.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Number of ranked labels to print per image.
    #[arg(long = "top_k", default_value_t = 3)]
    top_k: usize,
    /// Images to classify.
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    fisk_trainer::init_tracing();
    let args = Args::parse();

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let engine = InferenceEngine::<TrainBackend>::load(&args.model, &device)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    let thresholds = match &args.config {
        Some(path) => Some(ThresholdConfig::load(path)?),
        None => None,
    };
    let img_size = engine.metadata().img_size();

    for image in &args.images {
        let predictions = engine.classify_image(image, img_size, args.top_k)?;
        let Some(best) = predictions.first() else {
            continue;
        };
        let confidence = f64::from(best.confidence);
        let (threshold, accepted) = match &thresholds {
            Some(cfg) => (
                cfg.threshold_for(&best.label, DEFAULT_FALLBACK_THRESHOLD),
                cfg.accepts(&best.label, confidence),
            ),
            None => (DEFAULT_FALLBACK_THRESHOLD, confidence >= DEFAULT_FALLBACK_THRESHOLD),
        };
        let verdict = if accepted { "accept" } else { "reject" };
        let ranked: Vec<String> = predictions
            .iter()
            .map(|p| format!("{} {:.4}", p.label, p.confidence))
            .collect();
        println!(
            "{}: {} (threshold {:.4}) [{}]",
            image.display(),
            verdict,
            threshold,
            ranked.join(", ")
        );
    }
    Ok(())
}
