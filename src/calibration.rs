//! Per-class confidence threshold calibration.
//!
//! Scores are collected only for validation samples the model classified
//! correctly. For each class the collected confidences are sorted ascending
//! and the value at rank `max(0, floor(count * percentile) - 1)` becomes the
//! accept threshold for that class. Classes without a single correct
//! prediction get the fallback threshold.
//!
//! Nothing in this module touches the filesystem or the model; the calibrate
//! pipeline feeds it probability rows and persists the result.

use serde::ser::{Serialize, Serializer};

use crate::error::{FiskError, FiskResult};

/// Default share of correct confidences kept above the cutoff.
pub const DEFAULT_PERCENTILE: f64 = 0.8;

/// Threshold assigned to classes that never produced a correct prediction.
pub const DEFAULT_FALLBACK_THRESHOLD: f64 = 0.6;

/// Policy knobs for threshold selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPolicy {
    pub percentile: f64,
    pub fallback_threshold: f64,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        Self {
            percentile: DEFAULT_PERCENTILE,
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
        }
    }
}

impl CalibrationPolicy {
    /// Build a policy, rejecting percentiles outside (0, 1].
    pub fn new(percentile: f64, fallback_threshold: f64) -> FiskResult<Self> {
        if !(percentile > 0.0 && percentile <= 1.0) {
            return Err(FiskError::InvalidPercentile(percentile));
        }
        Ok(Self {
            percentile,
            fallback_threshold,
        })
    }
}

/// One correctly classified validation sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceSample {
    pub label_index: usize,
    pub confidence: f64,
}

/// Class name to cutoff mapping, kept in class-index order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerClassThresholds {
    entries: Vec<(String, f64)>,
}

impl PerClassThresholds {
    pub fn get(&self, class_name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == class_name)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Smallest cutoff across all classes; `None` when there are no classes.
    pub fn min_value(&self) -> Option<f64> {
        self.entries
            .iter()
            .map(|(_, value)| *value)
            .reduce(f64::min)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .entries
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::Value::from(*value)))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl FromIterator<(String, f64)> for PerClassThresholds {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Serialize for PerClassThresholds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(name, value)| (name, value)))
    }
}

/// Rank selected from `count` ascending scores.
pub fn threshold_index(count: usize, percentile: f64) -> usize {
    let rank = (count as f64 * percentile).floor() as usize;
    rank.saturating_sub(1).min(count.saturating_sub(1))
}

/// Round half to even at 4 decimals.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round_ties_even() / 10_000.0
}

/// Threshold for one class, or `None` when it has no scores.
pub fn select_threshold(scores: &[f64], percentile: f64) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(round4(sorted[threshold_index(sorted.len(), percentile)]))
}

/// Index of the first maximum, mirroring `argmax` semantics.
pub fn argmax(row: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in row.iter().enumerate() {
        match best {
            Some((_, current)) if !(value > current) => {}
            _ if value.is_nan() => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Accumulates confidences of correct predictions per class.
#[derive(Debug, Clone)]
pub struct ConfidenceCollector {
    class_names: Vec<String>,
    scores: Vec<Vec<f64>>,
    observed: usize,
    skipped_batches: usize,
}

impl ConfidenceCollector {
    pub fn new(class_names: Vec<String>) -> Self {
        let scores = vec![Vec::new(); class_names.len()];
        Self {
            class_names,
            scores,
            observed: 0,
            skipped_batches: 0,
        }
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Samples seen so far, correct or not.
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Batches ignored because the model has a single output unit.
    pub fn skipped_batches(&self) -> usize {
        self.skipped_batches
    }

    /// Score a single probability row against its true class.
    ///
    /// Returns the retained sample when the arg-max matches the target.
    pub fn observe(&mut self, true_index: usize, probs: &[f32]) -> Option<ConfidenceSample> {
        self.observed += 1;
        let predicted = argmax(probs)?;
        if predicted != true_index || true_index >= self.scores.len() {
            return None;
        }
        let sample = ConfidenceSample {
            label_index: predicted,
            confidence: f64::from(probs[predicted]),
        };
        self.scores[predicted].push(sample.confidence);
        Some(sample)
    }

    /// Score a flattened `[batch, num_outputs]` probability block.
    ///
    /// Single-output (binary) batches are skipped entirely. Returns the number
    /// of correctly classified samples in the batch.
    pub fn observe_batch(&mut self, probs: &[f32], num_outputs: usize, targets: &[usize]) -> usize {
        if num_outputs <= 1 {
            self.skipped_batches += 1;
            return 0;
        }
        probs
            .chunks_exact(num_outputs)
            .zip(targets)
            .filter_map(|(row, &target)| self.observe(target, row))
            .count()
    }

    /// Compute the cutoff for every class, applying the fallback to empty buckets.
    pub fn thresholds(&self, policy: &CalibrationPolicy) -> PerClassThresholds {
        self.class_names
            .iter()
            .zip(&self.scores)
            .map(|(name, scores)| {
                let value = select_threshold(scores, policy.percentile)
                    .unwrap_or(policy.fallback_threshold);
                (name.clone(), value)
            })
            .collect()
    }
}
