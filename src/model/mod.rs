pub mod config;
pub mod labels;
pub mod model_metadata;
pub mod model_storage;
pub mod threshold_config;

pub use config::{CalibrationSettings, DatasetSource, TrainingSettings, TRAIN_CONFIG_FILE_NAME};
pub use labels::{write_labels, LABELS_FILE_NAME};
pub use model_metadata::{ModelMetadata, WeightPrecision};
pub use model_storage::{
    load_metadata, load_model_with_metadata, log_metadata_info, read_archive_entry,
    save_model_with_metadata,
};
pub use threshold_config::ThresholdConfig;
