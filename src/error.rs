//! Error types shared by the dataset, archive, threshold-config and calibration code.

use std::path::PathBuf;
use thiserror::Error;

pub type FiskResult<T> = Result<T, FiskError>;

#[derive(Debug, Error)]
pub enum FiskError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no class folders found in {path}")]
    NoClasses { path: PathBuf },
    #[error("no images found under {path}")]
    EmptyDataset { path: PathBuf },
    #[error("class labels do not match: model has [{}], dataset has [{}]", expected.join(", "), found.join(", "))]
    LabelMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("percentile must be in (0, 1], got {0}")]
    InvalidPercentile(f64),
    #[error("validation split must be in (0, 1), got {0}")]
    InvalidSplit(f32),
    #[error("invalid threshold config at {path}: {msg}")]
    InvalidConfig { path: PathBuf, msg: String },
    #[error("model archive {path}: {msg}")]
    Archive { path: PathBuf, msg: String },
    #[error("model record error: {0}")]
    Record(String),
    #[error("{0}")]
    Usage(String),
}

impl FiskError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FiskError::Io {
            path: path.into(),
            source,
        }
    }
}
