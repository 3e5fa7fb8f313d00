use std::fs;

use fisk_trainer::calibration::{CalibrationPolicy, ConfidenceCollector};
use fisk_trainer::model::ThresholdConfig;
use serde_json::{json, Value};

fn collector_for_cod_and_tuna() -> ConfidenceCollector {
    let mut collector = ConfidenceCollector::new(vec!["cod".to_string(), "tuna".to_string()]);
    for score in [0.9f32, 0.5, 0.8, 0.6, 0.7] {
        collector.observe(0, &[score, 1.0 - score]);
    }
    // tuna images all predicted as cod
    collector.observe(1, &[0.85, 0.15]);
    collector
}

#[test]
fn calibrated_thresholds_merge_into_existing_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(&path, r#"{"otherKey": 1}"#).unwrap();

    let thresholds = collector_for_cod_and_tuna().thresholds(&CalibrationPolicy::default());
    let mut config = ThresholdConfig::load(&path).unwrap();
    config.merge(&thresholds).unwrap();
    config.save().unwrap();

    let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        written,
        json!({
            "otherKey": 1,
            "thresholds": {"multiClass": 0.6},
            "perClassThresholds": {"cod": 0.8, "tuna": 0.6}
        })
    );
}

#[test]
fn recalibration_is_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let thresholds = collector_for_cod_and_tuna().thresholds(&CalibrationPolicy::default());
        let mut config = ThresholdConfig::load(&path).unwrap();
        config.merge(&thresholds).unwrap();
        config.save().unwrap();
        outputs.push(fs::read(&path).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn existing_thresholds_section_keeps_other_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{"thresholds": {"singleClass": 0.7, "multiClass": 0.1}, "camera": {"fps": 30}}"#,
    )
    .unwrap();

    let policy = CalibrationPolicy::new(1.0, 0.6).unwrap();
    let thresholds = collector_for_cod_and_tuna().thresholds(&policy);
    let mut config = ThresholdConfig::load(&path).unwrap();
    config.merge(&thresholds).unwrap();
    config.save().unwrap();

    let reloaded = ThresholdConfig::load(&path).unwrap();
    assert_eq!(reloaded.single_class(), Some(0.7));
    assert_eq!(reloaded.multi_class(), Some(0.6));
    assert_eq!(reloaded.per_class("cod"), Some(0.9));
    assert_eq!(reloaded.document()["camera"], json!({"fps": 30}));
}
