//! Paired photo loading and Burn-compatible batching for old-photo restoration.
//!
//! This crate provides utilities for:
//! - Indexing degraded/clean photo pairs (plus optional defect masks) on disk
//! - Resize/flip/normalize transforms applied consistently across a pair
//! - Burn batch iteration through the `BatchSource` trait

pub mod aug;
pub mod batch;
pub mod pairs;
pub mod types;

pub use aug::{DatasetConfig, PairTransform};
pub use batch::{BatchSource, MappingBatch, PairedLoader};
pub use pairs::{index_pairs, IMAGE_DIR, LABEL_DIR, MASK_DIR};
pub use types::*;
