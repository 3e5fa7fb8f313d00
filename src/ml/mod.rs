pub mod calibrate;
pub mod callbacks;
pub mod dataset;
pub mod export;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use calibrate::{run_calibration, CalibrateArgs, CalibrationReport};
pub use dataset::{discover_classes, ImageBatch, ImageBatcher, ImageFolderDataset, ImageItem};
pub use inference::{rank_predictions, InferenceEngine, Prediction};
pub use ml_model::{load_and_normalize_image, Backbone, FishClassifier, ModelConfig};
pub use training::{run_training, TrainArgs, TrainingReport};
