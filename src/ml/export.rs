//! Export of the trained classifier.
//!
//! - `model.tar.gz`       full-precision archive used by calibration and inference
//! - `fish_model.tar.gz`  half-precision archive for on-device use, with `labels.txt` inside

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use tracing::{info, warn};

use crate::error::{FiskError, FiskResult};
use crate::ml::FishClassifier;
use crate::model::{
    labels::labels_text, save_model_with_metadata, ModelMetadata, WeightPrecision, LABELS_FILE_NAME,
};

pub const FULL_MODEL_NAME: &str = "model.tar.gz";
pub const QUANTIZED_MODEL_NAME: &str = "fish_model.tar.gz";

/// Paths written by [`export_model`].
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub full_model: PathBuf,
    pub quantized_model: PathBuf,
    pub quantized_precision: WeightPrecision,
}

/// Record the model weights at the requested precision.
pub fn encode_model<B: Backend>(
    model: &FishClassifier<B>,
    precision: WeightPrecision,
) -> FiskResult<Vec<u8>> {
    let record = model.clone().into_record();
    let encoded = match precision {
        WeightPrecision::Full => BinBytesRecorder::<FullPrecisionSettings>::default().record(record, ()),
        WeightPrecision::Half => BinBytesRecorder::<HalfPrecisionSettings>::default().record(record, ()),
    };
    encoded.map_err(|e| FiskError::Record(format!("{e:?}")))
}

/// Write the full-precision archive to `<output_dir>/model.tar.gz`.
pub fn export_full_precision<B: Backend>(
    model: &FishClassifier<B>,
    metadata: &ModelMetadata,
    output_dir: &Path,
) -> FiskResult<PathBuf> {
    let bytes = encode_model(model, WeightPrecision::Full)?;
    let metadata = metadata.clone().with_precision(WeightPrecision::Full);
    save_model_with_metadata(&output_dir.join(FULL_MODEL_NAME), &metadata, &bytes, &[])
}

/// Write the size-optimized archive to `<output_dir>/fish_model.tar.gz`.
///
/// Falls back to full precision with a warning when half-precision recording fails.
pub fn export_quantized<B: Backend>(
    model: &FishClassifier<B>,
    metadata: &ModelMetadata,
    output_dir: &Path,
) -> FiskResult<(PathBuf, WeightPrecision)> {
    let (bytes, precision) = match encode_model(model, WeightPrecision::Half) {
        Ok(bytes) => (bytes, WeightPrecision::Half),
        Err(e) => {
            warn!("half-precision export failed, using default encoding: {e}");
            (encode_model(model, WeightPrecision::Full)?, WeightPrecision::Full)
        }
    };
    let metadata = metadata.clone().with_precision(precision);
    let labels = labels_text(&metadata.class_labels);
    let path = save_model_with_metadata(
        &output_dir.join(QUANTIZED_MODEL_NAME),
        &metadata,
        &bytes,
        &[(LABELS_FILE_NAME, labels.as_bytes())],
    )?;
    Ok((path, precision))
}

/// Write both archives.
pub fn export_model<B: Backend>(
    model: &FishClassifier<B>,
    metadata: &ModelMetadata,
    output_dir: &Path,
) -> FiskResult<ExportReport> {
    let full_model = export_full_precision(model, metadata, output_dir)?;
    info!("Saved: {}", full_model.display());
    let (quantized_model, quantized_precision) = export_quantized(model, metadata, output_dir)?;
    info!("Saved: {} ({})", quantized_model.display(), quantized_precision);
    Ok(ExportReport {
        full_model,
        quantized_model,
        quantized_precision,
    })
}
