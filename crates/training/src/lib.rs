//! Training driver for the old-photo mapping GAN.
//!
//! - `options`: command-line / TOML run configuration.
//! - `progress`: `iter.txt` resume state and periodic-action bookkeeping.
//! - `losses`: named loss dictionary and the generator/discriminator objectives.
//! - `visualizer`: loss log, scalar sink, sample grids.
//! - `trainer`: the epoch/iteration loop.

#![recursion_limit = "256"]

pub mod losses;
pub mod options;
pub mod progress;
pub mod trainer;
pub mod visualizer;

use anyhow::Context;
use burn::backend::Autodiff;
use models::build_mapping_model;
use photo_dataset::PairedLoader;

pub use losses::LossDict;
pub use options::TrainOptions;
pub use progress::{PeriodicDeltas, ProgressState};
pub use trainer::{TrainSummary, Trainer};

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = Autodiff<TrainBackend>;

/// Load the paired dataset, build the model and train it.
pub fn run_train(opts: TrainOptions) -> anyhow::Result<TrainSummary> {
    let opts = opts.resolve()?;
    opts.validate()?;

    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let loader = PairedLoader::from_root(&opts.dataroot, opts.batch_size, opts.dataset_config())
        .with_context(|| format!("failed to index dataset at {}", opts.dataroot.display()))?;
    tracing::info!("dataset: {}", loader.describe());

    let model = build_mapping_model::<ADBackend>(opts.model_config(), &device)
        .context("failed to build the mapping model")?;
    let mut trainer = Trainer::<ADBackend, _, _>::new(opts, model, loader, device)?;
    let summary = trainer.run()?;
    tracing::info!(
        epochs = summary.epochs_run,
        total_steps = summary.total_steps,
        skipped = summary.skipped_iterations,
        "training finished"
    );
    Ok(summary)
}
