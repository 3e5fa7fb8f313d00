//! End-to-end train -> export -> calibrate on a tiny synthetic dataset.

use std::fs;
use std::path::Path;

use burn::data::dataset::Dataset;
use fisk_trainer::ml::{run_calibration, run_training, ImageFolderDataset, InferenceEngine};
use fisk_trainer::model::{
    load_metadata, read_archive_entry, CalibrationSettings, ThresholdConfig, TrainingSettings,
    WeightPrecision,
};
use fisk_trainer::{FiskError, TrainBackend};

fn write_class(root: &Path, class: &str, base: [u8; 3], count: usize) {
    let dir = root.join(class);
    fs::create_dir_all(&dir).unwrap();
    for i in 0..count {
        let shade = (i * 7) as u8;
        let pixel = image::Rgb([
            base[0].saturating_add(shade),
            base[1].saturating_add(shade),
            base[2].saturating_add(shade),
        ]);
        image::RgbImage::from_pixel(12, 12, pixel)
            .save(dir.join(format!("{class}_{i}.png")))
            .unwrap();
    }
}

fn settings_for(data_dir: &Path, output_dir: &Path) -> TrainingSettings {
    TrainingSettings {
        data_dir: Some(data_dir.to_path_buf()),
        output_dir: output_dir.to_path_buf(),
        img_size: 16,
        batch_size: 4,
        epochs: 1,
        num_workers: 0,
        ..Default::default()
    }
}

#[test]
fn train_export_and_calibrate() {
    let data = tempfile::tempdir().unwrap();
    write_class(data.path(), "torsk", [200, 40, 40], 6);
    write_class(data.path(), "makrell", [40, 40, 200], 6);
    let out = tempfile::tempdir().unwrap();

    let report = run_training(&settings_for(data.path(), out.path())).unwrap();
    assert_eq!(report.class_names, vec!["makrell", "torsk"]);
    assert_eq!(report.head_epochs, 1);
    assert_eq!(report.fine_tune_epochs, 3);

    assert_eq!(fs::read_to_string(out.path().join("labels.txt")).unwrap(), "makrell\ntorsk");
    assert!(out.path().join("checkpoint.mpk").exists());
    assert!(out.path().join("train_config.json").exists());
    let history = fs::read_to_string(out.path().join("history.csv")).unwrap();
    let mut rows = history.lines();
    assert_eq!(
        rows.next(),
        Some("phase,epoch,train_loss,train_accuracy,val_loss,val_accuracy,learning_rate")
    );
    assert_eq!(rows.count(), 4);

    let quantized = &report.export.quantized_model;
    assert_eq!(load_metadata(quantized).unwrap().precision, WeightPrecision::Half);
    assert_eq!(
        read_archive_entry(quantized, "labels.txt").unwrap(),
        Some(b"makrell\ntorsk".to_vec())
    );

    let engine = InferenceEngine::<TrainBackend>::load(quantized, &Default::default()).unwrap();
    let sample = data.path().join("torsk").join("torsk_0.png");
    let ranked = engine.classify_image(&sample, 16, 3).unwrap();
    assert_eq!(ranked.len(), 2);
    assert!(ranked[0].confidence >= ranked[1].confidence);

    let config_path = out.path().join("assets").join("config.json");
    fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    fs::write(&config_path, r#"{"otherKey": 1}"#).unwrap();
    let calibration = run_calibration(&CalibrationSettings {
        val_dir: data.path().to_path_buf(),
        model: report.export.full_model.clone(),
        img_size: 16,
        batch_size: 5,
        config: config_path.clone(),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(calibration.samples, 12);
    assert_eq!(calibration.thresholds.len(), 2);

    let config = ThresholdConfig::load(&config_path).unwrap();
    assert_eq!(config.document()["otherKey"], serde_json::json!(1));
    let min = calibration.thresholds.min_value().unwrap();
    assert_eq!(config.multi_class(), Some(min));
    for (label, value) in calibration.thresholds.iter() {
        assert_eq!(config.per_class(label), Some(value));
        assert!((0.0..=1.0).contains(&value));
    }
}

#[test]
fn calibration_rejects_mismatched_labels() {
    let data = tempfile::tempdir().unwrap();
    write_class(data.path(), "sei", [10, 120, 10], 5);
    write_class(data.path(), "hyse", [120, 10, 10], 5);
    let out = tempfile::tempdir().unwrap();
    let report = run_training(&settings_for(data.path(), out.path())).unwrap();

    let other = tempfile::tempdir().unwrap();
    write_class(other.path(), "hyse", [120, 10, 10], 2);
    write_class(other.path(), "laks", [10, 10, 120], 2);

    let err = run_calibration(&CalibrationSettings {
        val_dir: other.path().to_path_buf(),
        model: report.export.full_model,
        img_size: 16,
        config: out.path().join("config.json"),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FiskError>(),
        Some(FiskError::LabelMismatch { .. })
    ));
    assert!(!out.path().join("config.json").exists());
}

#[test]
fn separate_train_and_val_roots_share_class_order() {
    let train = tempfile::tempdir().unwrap();
    write_class(train.path(), "b_sild", [90, 90, 90], 3);
    write_class(train.path(), "a_torsk", [30, 30, 30], 3);
    let val = tempfile::tempdir().unwrap();
    write_class(val.path(), "b_sild", [90, 90, 90], 1);

    let classes = fisk_trainer::ml::discover_classes(train.path()).unwrap();
    let val_set = ImageFolderDataset::from_directory_with_order(val.path(), &classes).unwrap();
    assert_eq!(val_set.class_names(), ["a_torsk", "b_sild"]);
    assert_eq!(val_set.get(0).unwrap().label, 1);
    assert_eq!(val_set.len(), 1);
}

#[test]
fn calibration_accepts_val_root_missing_a_class() {
    let data = tempfile::tempdir().unwrap();
    write_class(data.path(), "sei", [10, 120, 10], 5);
    write_class(data.path(), "hyse", [120, 10, 10], 5);
    let out = tempfile::tempdir().unwrap();
    let report = run_training(&settings_for(data.path(), out.path())).unwrap();

    let val = tempfile::tempdir().unwrap();
    write_class(val.path(), "sei", [10, 120, 10], 3);
    let config_path = out.path().join("config.json");

    let calibration = run_calibration(&CalibrationSettings {
        val_dir: val.path().to_path_buf(),
        model: report.export.full_model,
        img_size: 16,
        config: config_path.clone(),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(calibration.samples, 3);
    let labels: Vec<&str> = calibration.thresholds.iter().map(|(label, _)| label).collect();
    assert_eq!(labels, ["hyse", "sei"]);
    assert_eq!(calibration.thresholds.get("hyse"), Some(0.6));

    let config = ThresholdConfig::load(&config_path).unwrap();
    assert_eq!(config.per_class("hyse"), Some(0.6));
}
