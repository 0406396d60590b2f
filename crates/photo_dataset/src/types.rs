//! Core types, error definitions, and data structures for photo_dataset.

use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no clean counterpart for {label} (expected {expected})")]
    MissingPartner { label: PathBuf, expected: PathBuf },
    #[error("no training pairs found under {root}")]
    Empty { root: PathBuf },
    #[error("{0}")]
    Other(String),
}

/// File locations for one training pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairIndex {
    /// Degraded photo fed to the network as the label map.
    pub label_path: PathBuf,
    /// Clean photo used as the target image.
    pub image_path: PathBuf,
    /// Optional scratch/defect mask used as the instance map.
    pub mask_path: Option<PathBuf>,
}

/// A decoded pair, CHW layout.
#[derive(Debug, Clone)]
pub struct PhotoSample {
    /// Degraded image, 3 channels, in [-1, 1].
    pub label_chw: Vec<f32>,
    /// Clean image, 3 channels, in [-1, 1].
    pub image_chw: Vec<f32>,
    /// Single channel mask in {0, 1}; zeros when the pair has no mask.
    pub mask_hw: Vec<f32>,
    pub width: u32,
    pub height: u32,
}
