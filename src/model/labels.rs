//! Plain-text label list shipped next to the model.
//!
//! One class name per line, in output-index order, no trailing newline.

use std::fs;
use std::path::Path;

use crate::error::{FiskError, FiskResult};

pub const LABELS_FILE_NAME: &str = "labels.txt";

/// Render the label list exactly as it is written to disk.
pub fn labels_text(class_names: &[String]) -> String {
    class_names.join("\n")
}

pub fn write_labels(path: &Path, class_names: &[String]) -> FiskResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| FiskError::io(parent, e))?;
    }
    fs::write(path, labels_text(class_names)).map_err(|e| FiskError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_have_no_trailing_newline() {
        let names = vec!["cod".to_string(), "haddock".to_string(), "tuna".to_string()];
        assert_eq!(labels_text(&names), "cod\nhaddock\ntuna");
    }

    #[test]
    fn write_then_read_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join(LABELS_FILE_NAME);
        let names = vec!["Zander".to_string(), "abbor".to_string(), "ørret".to_string()];
        write_labels(&path, &names).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Zander\nabbor\nørret");
    }
}
