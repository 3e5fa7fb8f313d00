//! Threshold section of the app's JSON config.
//!
//! The document is shared with the mobile app, so every key this crate does
//! not own is carried through untouched and key order is preserved. Only
//! `thresholds.multiClass` and `perClassThresholds` are ever written.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::calibration::{PerClassThresholds, DEFAULT_FALLBACK_THRESHOLD};
use crate::error::{FiskError, FiskResult};

pub const THRESHOLDS_KEY: &str = "thresholds";
pub const MULTI_CLASS_KEY: &str = "multiClass";
pub const SINGLE_CLASS_KEY: &str = "singleClass";
pub const PER_CLASS_KEY: &str = "perClassThresholds";

/// Default location inside the app module.
pub const DEFAULT_CONFIG_PATH: &str = "app/src/main/assets/config.json";

#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    path: PathBuf,
    doc: Map<String, Value>,
}

impl ThresholdConfig {
    /// Read the config at `path`; a missing file starts as `{}`.
    ///
    /// Malformed JSON is an error, never a silent reset.
    pub fn load<P: AsRef<Path>>(path: P) -> FiskResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Self {
                path,
                doc: Map::new(),
            });
        }
        let content = fs::read_to_string(&path).map_err(|e| FiskError::io(&path, e))?;
        let value: Value = serde_json::from_str(&content).map_err(|source| FiskError::Json {
            path: path.clone(),
            source,
        })?;
        Self::from_value(path, value)
    }

    pub fn from_value(path: PathBuf, value: Value) -> FiskResult<Self> {
        match value {
            Value::Object(doc) => Ok(Self { path, doc }),
            other => Err(FiskError::InvalidConfig {
                path,
                msg: format!("expected a JSON object at the top level, found {}", kind(&other)),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.doc
    }

    /// Fold freshly computed thresholds into the document.
    ///
    /// `perClassThresholds` is replaced wholesale. `thresholds.multiClass`
    /// becomes the minimum per-class value, and is left alone when the
    /// mapping is empty.
    pub fn merge(&mut self, per_class: &PerClassThresholds) -> FiskResult<()> {
        let thresholds = match self
            .doc
            .entry(THRESHOLDS_KEY)
            .or_insert_with(|| Value::Object(Map::new()))
        {
            Value::Object(map) => map,
            other => {
                return Err(FiskError::InvalidConfig {
                    path: self.path.clone(),
                    msg: format!("`{THRESHOLDS_KEY}` must be an object, found {}", kind(other)),
                })
            }
        };
        if let Some(min) = per_class.min_value() {
            thresholds.insert(MULTI_CLASS_KEY.to_string(), Value::from(min));
        }
        self.doc.insert(PER_CLASS_KEY.to_string(), per_class.to_json());
        Ok(())
    }

    pub fn multi_class(&self) -> Option<f64> {
        self.threshold_field(MULTI_CLASS_KEY)
    }

    pub fn single_class(&self) -> Option<f64> {
        self.threshold_field(SINGLE_CLASS_KEY)
    }

    pub fn per_class(&self, label: &str) -> Option<f64> {
        self.doc.get(PER_CLASS_KEY)?.get(label)?.as_f64()
    }

    /// Cutoff applied to `label`: per-class value, then the global
    /// multi-class value, then `fallback`.
    pub fn threshold_for(&self, label: &str, fallback: f64) -> f64 {
        self.per_class(label)
            .or_else(|| self.multi_class())
            .unwrap_or(fallback)
    }

    pub fn accepts(&self, label: &str, confidence: f64) -> bool {
        confidence >= self.threshold_for(label, DEFAULT_FALLBACK_THRESHOLD)
    }

    pub fn to_pretty_string(&self) -> FiskResult<String> {
        serde_json::to_string_pretty(&self.doc).map_err(|source| FiskError::Json {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the document back to its path through a sibling temp file and rename.
    pub fn save(&self) -> FiskResult<()> {
        let content = self.to_pretty_string()?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| FiskError::io(&parent, e))?;

        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| FiskError::io(&parent, e))?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.flush())
            .map_err(|e| FiskError::io(tmp.path(), e))?;
        // temp files are created 0600; an existing config keeps its mode
        if let Ok(existing) = fs::metadata(&self.path) {
            tmp.as_file()
                .set_permissions(existing.permissions())
                .map_err(|e| FiskError::io(tmp.path(), e))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| FiskError::io(&self.path, e.error))?;
        Ok(())
    }

    fn threshold_field(&self, key: &str) -> Option<f64> {
        self.doc.get(THRESHOLDS_KEY)?.get(key)?.as_f64()
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
