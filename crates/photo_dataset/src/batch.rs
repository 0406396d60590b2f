//! Batch iteration for training.

use crate::aug::{DatasetConfig, PairTransform};
use crate::pairs::{index_pairs, load_pair};
use crate::types::{DatasetError, DatasetResult, PairIndex};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::path::Path;
use std::time::{Duration, Instant};

const LOG_EVERY_BATCHES: usize = 500;

/// One training batch: degraded photo (label), mask (inst), clean photo (image), optional features.
#[derive(Debug, Clone)]
pub struct MappingBatch<B: Backend> {
    /// `[batch, 3, h, w]` in [-1, 1].
    pub label: Tensor<B, 4>,
    /// `[batch, 1, h, w]` in {0, 1}.
    pub inst: Tensor<B, 4>,
    /// `[batch, 3, h, w]` in [-1, 1].
    pub image: Tensor<B, 4>,
    /// Precomputed instance features; unused by the mapping model.
    pub feat: Option<Tensor<B, 4>>,
}

impl<B: Backend> MappingBatch<B> {
    pub fn batch_len(&self) -> usize {
        self.image.dims()[0]
    }

    /// Move every tensor to `device`.
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            label: self.label.to_device(device),
            inst: self.inst.to_device(device),
            image: self.image.to_device(device),
            feat: self.feat.map(|f| f.to_device(device)),
        }
    }
}

/// A restartable source of batches; one call to `start_epoch` begins a new pass.
pub trait BatchSource<B: Backend> {
    /// Number of batches in one pass.
    fn num_batches(&self) -> usize;
    fn batch_size(&self) -> usize;
    fn start_epoch(&mut self);
    /// Next batch of the current pass, `Ok(None)` once the pass is exhausted.
    fn next_batch(&mut self, device: &B::Device) -> DatasetResult<Option<MappingBatch<B>>>;
}

pub struct PairedLoader {
    indices: Vec<PairIndex>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    shuffle: bool,
    transform: PairTransform,
    rng: StdRng,
    processed_batches: usize,
    started: Instant,
    total_load_time: Duration,
}

impl PairedLoader {
    pub fn from_root(root: &Path, batch_size: usize, cfg: DatasetConfig) -> DatasetResult<Self> {
        let indices = index_pairs(root)?;
        Self::from_indices(indices, batch_size, cfg)
    }

    pub fn from_indices(
        indices: Vec<PairIndex>,
        batch_size: usize,
        cfg: DatasetConfig,
    ) -> DatasetResult<Self> {
        if indices.is_empty() {
            return Err(DatasetError::Other("cannot build a loader over zero pairs".into()));
        }
        if batch_size == 0 {
            return Err(DatasetError::Other("batch size must be at least 1".into()));
        }
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let order = (0..indices.len()).collect();
        Ok(Self {
            indices,
            order,
            cursor: 0,
            batch_size,
            shuffle: cfg.shuffle,
            transform: PairTransform::from_config(&cfg),
            rng,
            processed_batches: 0,
            started: Instant::now(),
            total_load_time: Duration::ZERO,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    pub fn describe(&self) -> String {
        format!(
            "pairs={} batch_size={} shuffle={} {}",
            self.indices.len(),
            self.batch_size,
            self.shuffle,
            self.transform.describe()
        )
    }

    fn maybe_log_progress(&self) {
        if self.processed_batches % LOG_EVERY_BATCHES != 0 {
            return;
        }
        let avg_load_ms =
            (self.total_load_time.as_secs_f64() * 1000.0) / self.processed_batches.max(1) as f64;
        tracing::debug!(
            batches = self.processed_batches,
            elapsed_s = self.started.elapsed().as_secs_f32(),
            avg_load_ms,
            "[dataset] progress"
        );
    }
}

impl<B: Backend> BatchSource<B> for PairedLoader {
    fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn start_epoch(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    fn next_batch(&mut self, device: &B::Device) -> DatasetResult<Option<MappingBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let picks: Vec<(usize, bool)> = self.order[self.cursor..end]
            .iter()
            .map(|&i| (i, self.transform.draw_flip(&mut self.rng)))
            .collect();
        self.cursor = end;

        let t_load = Instant::now();
        let loaded: Vec<_> = picks
            .par_iter()
            .map(|&(i, flip)| load_pair(&self.indices[i], &self.transform, flip))
            .collect::<DatasetResult<Vec<_>>>()?;
        self.total_load_time += t_load.elapsed();

        let batch_len = loaded.len();
        let side = self.transform.load_size as usize;
        let mut labels = Vec::with_capacity(batch_len * 3 * side * side);
        let mut images = Vec::with_capacity(batch_len * 3 * side * side);
        let mut masks = Vec::with_capacity(batch_len * side * side);
        for sample in loaded {
            labels.extend_from_slice(&sample.label_chw);
            images.extend_from_slice(&sample.image_chw);
            masks.extend_from_slice(&sample.mask_hw);
        }

        let label =
            Tensor::<B, 4>::from_data(TensorData::new(labels, [batch_len, 3, side, side]), device);
        let image =
            Tensor::<B, 4>::from_data(TensorData::new(images, [batch_len, 3, side, side]), device);
        let inst =
            Tensor::<B, 4>::from_data(TensorData::new(masks, [batch_len, 1, side, side]), device);

        self.processed_batches += 1;
        self.maybe_log_progress();

        Ok(Some(MappingBatch {
            label,
            inst,
            image,
            feat: None,
        }))
    }
}
