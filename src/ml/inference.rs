//! Model inference

use std::path::Path;

use burn::{
    module::Module,
    record::{
        BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder, RecorderError,
    },
    tensor::{backend::Backend, Tensor, TensorData},
};

use crate::error::{FiskError, FiskResult};
use crate::ml::{load_and_normalize_image, FishClassifier};
use crate::model::{load_model_with_metadata, ModelMetadata, WeightPrecision};

/// One ranked prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub index: usize,
    pub label: String,
    pub confidence: f32,
}

/// Inference engine
pub struct InferenceEngine<B: Backend> {
    model: FishClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// Load a model archive written by the exporter.
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> FiskResult<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let model = metadata.model.init::<B>(device);

        let to_err = |e: RecorderError| FiskError::Record(format!("{e:?}"));
        let model = match metadata.precision {
            WeightPrecision::Full => {
                let record = BinBytesRecorder::<FullPrecisionSettings>::default()
                    .load(model_binary, device)
                    .map_err(to_err)?;
                model.load_record(record)
            }
            WeightPrecision::Half => {
                let record = BinBytesRecorder::<HalfPrecisionSettings>::default()
                    .load(model_binary, device)
                    .map_err(to_err)?;
                model.load_record(record)
            }
        };

        Ok(Self::from_model(model, metadata, device.clone()))
    }

    pub fn from_model(model: FishClassifier<B>, metadata: ModelMetadata, device: B::Device) -> Self {
        Self {
            model,
            metadata,
            device,
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn class_labels(&self) -> &[String] {
        &self.metadata.class_labels
    }

    pub fn num_outputs(&self) -> usize {
        self.model.num_outputs()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Probabilities for a batch, flattened row-major as `[batch, num_outputs]`.
    pub fn predict_batch(&self, images: Tensor<B, 4>) -> FiskResult<Vec<f32>> {
        self.model
            .predict_proba(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| FiskError::Record(format!("failed to read probabilities: {e:?}")))
    }

    /// Classify a single image and return the `top_k` labels.
    pub fn classify_image<P: AsRef<Path>>(
        &self,
        image_path: P,
        image_size: usize,
        top_k: usize,
    ) -> FiskResult<Vec<Prediction>> {
        let image_data = load_and_normalize_image(image_path.as_ref(), image_size)?;
        let tensor = Tensor::<B, 4>::from_data(
            TensorData::new(image_data, [1, 3, image_size, image_size]),
            &self.device,
        );
        let probs = self.predict_batch(tensor)?;
        Ok(rank_predictions(&probs, self.class_labels(), top_k))
    }
}

/// Sort one probability row descending and keep the first `top_k` entries.
pub fn rank_predictions(probs: &[f32], labels: &[String], top_k: usize) -> Vec<Prediction> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    order
        .into_iter()
        .take(top_k)
        .map(|index| Prediction {
            index,
            label: labels.get(index).cloned().unwrap_or_else(|| format!("class_{index}")),
            confidence: probs[index],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        ["cod", "haddock", "tuna", "eel"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ranking_keeps_top_k_in_descending_order() {
        let ranked = rank_predictions(&[0.1, 0.5, 0.3, 0.1], &labels(), 3);
        let names: Vec<&str> = ranked.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(names, vec!["haddock", "tuna", "cod"]);
        assert_eq!(ranked[0].confidence, 0.5);
    }

    #[test]
    fn ranking_is_stable_for_ties() {
        let ranked = rank_predictions(&[0.25, 0.25, 0.25, 0.25], &labels(), 2);
        assert_eq!(ranked[0].index, 0);
        assert_eq!(ranked[1].index, 1);
    }
}
