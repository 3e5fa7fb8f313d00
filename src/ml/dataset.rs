//! Image-folder dataset: one subdirectory per class.

use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{FiskError, FiskResult};
use crate::ml::ml_model::load_and_normalize_image;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Image files anywhere below `class_dir`.
///
/// Grouped by containing directory (directories in byte order), then by file
/// name, so `cod/b.png` precedes `cod/trip1/a.png`.
fn collect_images(class_dir: &Path) -> FiskResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(class_dir).follow_links(true) {
        let entry = entry.map_err(|e| FiskError::io(class_dir, e.into()))?;
        if is_image(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    paths.sort_by(|a, b| {
        a.parent()
            .map(Path::as_os_str)
            .cmp(&b.parent().map(Path::as_os_str))
            .then_with(|| a.file_name().cmp(&b.file_name()))
    });
    Ok(paths)
}

/// Class names under `root`, sorted byte-wise.
pub fn discover_classes(root: &Path) -> FiskResult<Vec<String>> {
    let mut classes = Vec::new();
    for entry in std::fs::read_dir(root).map_err(|e| FiskError::io(root, e))? {
        let path = entry.map_err(|e| FiskError::io(root, e))?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name() {
                classes.push(name.to_string_lossy().into_owned());
            }
        }
    }
    if classes.is_empty() {
        return Err(FiskError::NoClasses {
            path: root.to_path_buf(),
        });
    }
    classes.sort();
    Ok(classes)
}

/// Dataset item (path only; pixels are decoded by the batcher)
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// Image-folder dataset holding paths and class ids
#[derive(Clone, Debug)]
pub struct ImageFolderDataset {
    samples: Vec<ImageItem>,
    class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// Load a root, discovering its classes.
    pub fn from_directory(root: &Path) -> FiskResult<Self> {
        let classes = discover_classes(root)?;
        Self::from_directory_with_order(root, &classes)
    }

    /// Load a root with an imposed class order.
    ///
    /// Classes missing on disk contribute no samples.
    pub fn from_directory_with_order(root: &Path, class_order: &[String]) -> FiskResult<Self> {
        if !root.is_dir() {
            return Err(FiskError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "dataset directory not found"),
            ));
        }

        let mut samples = Vec::new();
        for (label, class_name) in class_order.iter().enumerate() {
            let class_dir = root.join(class_name);
            if !class_dir.is_dir() {
                debug!("class directory missing: {}", class_dir.display());
                continue;
            }

            let paths = collect_images(&class_dir)?;
            samples.extend(paths.into_iter().map(|path| ImageItem { path, label }));
        }

        if samples.is_empty() {
            return Err(FiskError::EmptyDataset {
                path: root.to_path_buf(),
            });
        }

        Ok(Self {
            samples,
            class_names: class_order.to_vec(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn samples(&self) -> &[ImageItem] {
        &self.samples
    }

    /// Samples per class, indexed like `class_names`.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for item in &self.samples {
            counts[item.label] += 1;
        }
        counts
    }

    /// Shuffle with `seed` and hold out the last `floor(n * val_split)` samples.
    pub fn split(self, val_split: f32, seed: u64) -> FiskResult<(Self, Self)> {
        if !(val_split > 0.0 && val_split < 1.0) {
            return Err(FiskError::InvalidSplit(val_split));
        }

        let mut samples = self.samples;
        let mut rng = StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let total = samples.len();
        let val_len = (total as f64 * f64::from(val_split)).floor() as usize;
        if val_len == 0 || val_len == total {
            return Err(FiskError::Usage(format!(
                "validation split {val_split} of {total} images leaves an empty subset"
            )));
        }

        let val_samples = samples.split_off(total - val_len);
        let train = Self {
            samples,
            class_names: self.class_names.clone(),
        };
        let val = Self {
            samples: val_samples,
            class_names: self.class_names,
        };
        Ok((train, val))
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Batch data
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// Host copy of the targets for metrics and calibration
    pub labels: Vec<usize>,
}

/// Decodes a list of items into one batch tensor
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: usize,
}

impl ImageBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items {
            match load_and_normalize_image(&item.path, size) {
                Ok(image_data) => all_pixels.extend_from_slice(&image_data),
                Err(e) => {
                    warn!("zero-filling unreadable image: {e}");
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            labels.push(item.label);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(all_pixels, [batch_size, 3, size, size]),
            device,
        );
        let targets_vec: Vec<i64> = labels.iter().map(|&label| label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_vec, [batch_size]), device);

        ImageBatch {
            images,
            targets,
            labels,
        }
    }
}
