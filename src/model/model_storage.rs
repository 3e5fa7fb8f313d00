//! Model archive persistence
//!
//! A model is shipped as a single tar.gz holding:
//! - metadata.json   - class labels, architecture, training summary
//! - model.bin       - recorded weights
//! - labels.txt      - optional copy of the label list for on-device use

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::info;

use crate::error::{FiskError, FiskResult};
use crate::model::model_metadata::ModelMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MODEL_ENTRY: &str = "model.bin";

/// Resolve the on-disk archive path, appending `.tar.gz` unless already present.
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// Save weights and metadata (plus any extra entries) into one tar.gz.
///
/// Returns the path actually written.
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
    extra_entries: &[(&str, &[u8])],
) -> FiskResult<PathBuf> {
    let tar_gz_path = archive_path(output_path);
    let archive_err = |msg: String| FiskError::Archive {
        path: tar_gz_path.clone(),
        msg,
    };

    if let Some(parent) = tar_gz_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| FiskError::io(parent, e))?;
    }

    let tar_gz_file = File::create(&tar_gz_path).map_err(|e| FiskError::io(&tar_gz_path, e))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata
        .to_json_string()
        .map_err(|e| archive_err(format!("failed to serialize metadata: {e}")))?;

    let entries = [(METADATA_ENTRY, json_str.as_bytes()), (MODEL_ENTRY, model_binary)];
    for (name, bytes) in entries.iter().chain(extra_entries.iter()) {
        let mut header = tar::Header::new_gnu();
        header
            .set_path(name)
            .map_err(|e| archive_err(format!("invalid entry name {name}: {e}")))?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder
            .append(&header, *bytes)
            .map_err(|e| archive_err(format!("failed to add {name}: {e}")))?;
    }

    tar_builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| archive_err(format!("failed to finalize archive: {e}")))?;

    Ok(tar_gz_path)
}

/// Read a single named entry from the archive, if it exists.
pub fn read_archive_entry(tar_gz_path: &Path, entry_name: &str) -> FiskResult<Option<Vec<u8>>> {
    let mut found = None;
    visit_entries(tar_gz_path, |name, bytes| {
        if found.is_none() && name == entry_name {
            found = Some(bytes);
        }
    })?;
    Ok(found)
}

/// Read only the model metadata.
pub fn load_metadata(tar_gz_path: &Path) -> FiskResult<ModelMetadata> {
    let bytes = read_archive_entry(tar_gz_path, METADATA_ENTRY)?
        .ok_or_else(|| missing(tar_gz_path, METADATA_ENTRY))?;
    parse_metadata(tar_gz_path, &bytes)
}

/// Read metadata and weights in one pass.
pub fn load_model_with_metadata(tar_gz_path: &Path) -> FiskResult<(ModelMetadata, Vec<u8>)> {
    let mut metadata_bytes = None;
    let mut model_binary = None;
    visit_entries(tar_gz_path, |name, bytes| match name {
        METADATA_ENTRY => metadata_bytes = Some(bytes),
        MODEL_ENTRY => model_binary = Some(bytes),
        _ => {}
    })?;

    match (metadata_bytes, model_binary) {
        (Some(metadata), Some(binary)) => Ok((parse_metadata(tar_gz_path, &metadata)?, binary)),
        (None, _) => Err(missing(tar_gz_path, METADATA_ENTRY)),
        (_, None) => Err(missing(tar_gz_path, MODEL_ENTRY)),
    }
}

/// Log a short summary of the metadata.
pub fn log_metadata_info(metadata: &ModelMetadata) {
    info!(
        classes = metadata.class_labels.len(),
        img_size = metadata.img_size(),
        precision = %metadata.precision,
        head_epochs = metadata.head_epochs,
        fine_tune_epochs = metadata.fine_tune_epochs,
        trained_at = %metadata.trained_at,
        "model metadata"
    );
    info!("labels: {}", metadata.class_labels.join(", "));
}

fn visit_entries(tar_gz_path: &Path, mut visit: impl FnMut(&str, Vec<u8>)) -> FiskResult<()> {
    let archive_err = |e: std::io::Error| FiskError::Archive {
        path: tar_gz_path.to_path_buf(),
        msg: e.to_string(),
    };
    let tar_gz_file = File::open(tar_gz_path).map_err(|e| FiskError::io(tar_gz_path, e))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let name = entry
            .path()
            .map_err(archive_err)?
            .to_string_lossy()
            .into_owned();
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer).map_err(archive_err)?;
        visit(&name, buffer);
    }
    Ok(())
}

fn parse_metadata(tar_gz_path: &Path, bytes: &[u8]) -> FiskResult<ModelMetadata> {
    let json = std::str::from_utf8(bytes).map_err(|e| FiskError::Archive {
        path: tar_gz_path.to_path_buf(),
        msg: format!("{METADATA_ENTRY} is not UTF-8: {e}"),
    })?;
    ModelMetadata::from_json_string(json).map_err(|source| FiskError::Json {
        path: tar_gz_path.join(METADATA_ENTRY),
        source,
    })
}

fn missing(tar_gz_path: &Path, entry: &str) -> FiskError {
    FiskError::Archive {
        path: tar_gz_path.to_path_buf(),
        msg: format!("{entry} not found in tar.gz archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ModelConfig;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(
            vec!["cod".to_string(), "tuna".to_string()],
            ModelConfig::new(2).with_image_size(32),
            2,
            3,
            None,
        )
    }

    #[test]
    fn archive_path_appends_extension() {
        assert_eq!(archive_path(Path::new("out/model")), PathBuf::from("out/model.tar.gz"));
        assert_eq!(
            archive_path(Path::new("out/model.tar.gz")),
            PathBuf::from("out/model.tar.gz")
        );
    }

    #[test]
    fn save_and_load_entries() {
        let dir = tempfile::tempdir().unwrap();
        let written = save_model_with_metadata(
            &dir.path().join("fish_model"),
            &metadata(),
            &[1, 2, 3, 4],
            &[("labels.txt", &b"cod\ntuna"[..])],
        )
        .unwrap();
        assert!(written.ends_with("fish_model.tar.gz"));

        let (loaded, binary) = load_model_with_metadata(&written).unwrap();
        assert_eq!(loaded.class_labels, vec!["cod", "tuna"]);
        assert_eq!(loaded.img_size(), 32);
        assert_eq!(binary, vec![1, 2, 3, 4]);
        assert_eq!(
            read_archive_entry(&written, "labels.txt").unwrap().as_deref(),
            Some(&b"cod\ntuna"[..])
        );
        assert_eq!(read_archive_entry(&written, "nope").unwrap(), None);
        assert_eq!(load_metadata(&written).unwrap().head_epochs, 2);
    }

    #[test]
    fn missing_archive_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_metadata(&dir.path().join("absent.tar.gz")).unwrap_err();
        assert!(matches!(err, FiskError::Io { .. }));
    }
}
