//! Indexing and decoding of degraded/clean photo pairs.

use crate::aug::PairTransform;
use crate::types::{DatasetError, DatasetResult, PairIndex, PhotoSample};
use std::fs;
use std::path::{Path, PathBuf};

pub const LABEL_DIR: &str = "train_A";
pub const IMAGE_DIR: &str = "train_B";
pub const MASK_DIR: &str = "train_mask";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Pair every image in `<root>/train_A` with the same file name in `<root>/train_B`.
///
/// Masks under `<root>/train_mask` are optional per pair. The result is sorted by file name.
pub fn index_pairs(root: &Path) -> DatasetResult<Vec<PairIndex>> {
    let label_dir = root.join(LABEL_DIR);
    let image_dir = root.join(IMAGE_DIR);
    let mask_dir = root.join(MASK_DIR);

    let entries = fs::read_dir(&label_dir).map_err(|e| DatasetError::Io {
        path: label_dir.clone(),
        source: e,
    })?;
    let mut labels: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DatasetError::Io {
            path: label_dir.clone(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_file() && is_image_file(&path) {
            labels.push(path);
        }
    }
    labels.sort();

    let mut pairs = Vec::with_capacity(labels.len());
    for label_path in labels {
        let Some(file_name) = label_path.file_name() else {
            continue;
        };
        let image_path = image_dir.join(file_name);
        if !image_path.exists() {
            return Err(DatasetError::MissingPartner {
                label: label_path,
                expected: image_path,
            });
        }
        let mask_path = Some(mask_dir.join(file_name)).filter(|p| p.exists());
        pairs.push(PairIndex {
            label_path,
            image_path,
            mask_path,
        });
    }

    if pairs.is_empty() {
        return Err(DatasetError::Empty {
            root: root.to_path_buf(),
        });
    }
    Ok(pairs)
}

fn open_rgb(path: &Path) -> DatasetResult<image::RgbImage> {
    Ok(image::open(path)
        .map_err(|e| DatasetError::Image {
            path: path.to_path_buf(),
            source: e,
        })?
        .to_rgb8())
}

pub(crate) fn load_pair(
    idx: &PairIndex,
    transform: &PairTransform,
    flip: bool,
) -> DatasetResult<PhotoSample> {
    let label = open_rgb(&idx.label_path)?;
    let image = open_rgb(&idx.image_path)?;
    let mask = match &idx.mask_path {
        Some(path) => Some(
            image::open(path)
                .map_err(|e| DatasetError::Image {
                    path: path.clone(),
                    source: e,
                })?
                .to_luma8(),
        ),
        None => None,
    };
    transform.apply(label, image, mask, flip)
}
