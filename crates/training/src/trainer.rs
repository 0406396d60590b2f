//! Epoch/iteration loop driving a [`MappingModel`] over a [`BatchSource`].

use crate::losses::LossDict;
use crate::options::TrainOptions;
use crate::progress::{
    epoch_override, fires, saved_position, total_steps, PeriodicDeltas, ProgressState,
};
use crate::visualizer::{save_sample_grid, write_text, Visualizer};
use anyhow::Context;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use models::MappingModel;
use photo_dataset::{BatchSource, MappingBatch};
use std::fs;
use std::marker::PhantomData;
use std::time::Instant;

/// Images per group in a sample grid.
pub const SAMPLE_IMAGES: usize = 5;

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainSummary {
    pub epochs_run: usize,
    pub total_steps: usize,
    /// Iterations the model asked to skip.
    pub skipped_iterations: usize,
    /// Iterations that stepped both optimizers.
    pub optimized_iterations: usize,
    pub log_lines: usize,
    pub samples_written: usize,
    /// Calls to `save`, one per tag.
    pub checkpoints_written: usize,
    pub final_lr: f64,
}

pub struct Trainer<B: AutodiffBackend, M, S> {
    opts: TrainOptions,
    model: M,
    source: S,
    visualizer: Visualizer,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B, M, S> Trainer<B, M, S>
where
    B: AutodiffBackend,
    M: MappingModel<B>,
    S: BatchSource<B>,
{
    /// Prepare output directories and write `opt.txt` and `model.txt`.
    pub fn new(opts: TrainOptions, model: M, source: S, device: B::Device) -> anyhow::Result<Self> {
        opts.validate()?;
        anyhow::ensure!(opts.is_train, "the mapping trainer needs is_train = true");
        if opts.gpu_ids()?.len() > 1 {
            tracing::warn!(
                gpu_ids = %opts.gpu_ids,
                "multiple devices requested; training runs on a single device"
            );
        }

        let expr_dir = opts.expr_dir();
        let sample_dir = opts.sample_dir();
        fs::create_dir_all(&sample_dir)
            .with_context(|| format!("failed to create {}", sample_dir.display()))?;
        let visualizer = Visualizer::new(&expr_dir)?;
        opts.save_text()?;
        write_text(
            &expr_dir.join("model.txt"),
            &model.describe(opts.use_skip_model),
        )?;

        Ok(Self {
            opts,
            model,
            source,
            visualizer,
            device,
            _backend: PhantomData,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Train from the resume point until `niter + niter_decay` epochs are done.
    pub fn run(&mut self) -> anyhow::Result<TrainSummary> {
        let Self {
            opts,
            model,
            source,
            visualizer,
            device,
            ..
        } = self;

        let batch_size = source.batch_size();
        let dataset_size = source.num_batches() * batch_size;
        anyhow::ensure!(dataset_size > 0, "the training set is empty");
        visualizer.print_save(&format!("#training images = {dataset_size}"))?;

        let iter_path = opts.iter_path();
        // Notices report the last completed epoch.
        let mut resume = saved_position(opts, &iter_path);
        if opts.continue_train {
            visualizer.print_save(&format!(
                "Resuming from epoch {} at iteration {}",
                resume.epoch.saturating_sub(1),
                resume.epoch_iter
            ))?;
        }
        if let Some(epoch) = epoch_override(opts)? {
            resume.epoch = epoch;
            visualizer.print_save(&format!(
                "Notice : Resuming from epoch {} at iteration {}",
                epoch.saturating_sub(1),
                resume.epoch_iter
            ))?;
        }
        let start_epoch = resume.epoch;
        let mut epoch_iter = resume.epoch_iter;
        let mut steps = total_steps(start_epoch, epoch_iter, dataset_size);
        let deltas = PeriodicDeltas::new(steps, opts);
        let last_epoch = opts.niter + opts.niter_decay;
        let names = model.loss_names();

        let mut summary = TrainSummary::default();
        for epoch in start_epoch..=last_epoch {
            let epoch_start = Instant::now();
            if epoch != start_epoch {
                epoch_iter %= dataset_size;
            }
            source.start_epoch();

            let mut i = epoch_iter;
            while let Some(batch) = source
                .next_batch(device)
                .with_context(|| format!("failed to load a batch in epoch {epoch}"))?
            {
                let iter_start = Instant::now();
                steps += batch_size;
                epoch_iter += batch_size;
                let save_fake = fires(steps, opts.display_freq, deltas.display);

                let batch = batch.to_device(device);
                let output = model.forward(&batch, save_fake)?;
                match output.losses {
                    None => {
                        summary.skipped_iterations += 1;
                        tracing::warn!(epoch, epoch_iter, "model skipped a degenerate batch");
                        // A skip never ends the epoch early.
                        i += 1;
                        continue;
                    }
                    Some(losses) => {
                        let dict = LossDict::from_lists(&names, losses)?;
                        let loss_d = dict.discriminator_loss()?;
                        let loss_g = dict.generator_loss()?;
                        model.optimize_mapping(loss_g);
                        model.optimize_discriminator(loss_d);
                        summary.optimized_iterations += 1;

                        if i == 0 || fires(steps, opts.print_freq, deltas.print) {
                            let errors = dict.errors();
                            let t = iter_start.elapsed().as_secs_f64() / batch_size as f64;
                            visualizer.print_current_errors(
                                epoch,
                                epoch_iter,
                                &errors,
                                t,
                                model.old_lr(),
                            )?;
                            visualizer.plot_current_errors(&errors, steps)?;
                            summary.log_lines += 1;
                        }

                        if save_fake {
                            if let Some(generated) = output.generated {
                                let path = opts.sample_dir().join(format!("{epoch}_{steps}.png"));
                                let grid = sample_grid(&batch, generated, opts.nl_use_mask);
                                match save_sample_grid(&path, grid, SAMPLE_IMAGES) {
                                    Ok(()) => summary.samples_written += 1,
                                    Err(err) => {
                                        tracing::error!("failed to save {}: {err:#}", path.display())
                                    }
                                }
                            }
                        }

                        if fires(steps, opts.save_latest_freq, deltas.save_latest) {
                            visualizer.print_save(&format!(
                                "saving the latest model (epoch {epoch}, total_steps {steps})"
                            ))?;
                            model.save("latest")?;
                            ProgressState::new(epoch, epoch_iter).save(&iter_path)?;
                            summary.checkpoints_written += 1;
                        }
                    }
                }

                i += 1;
                if epoch_iter >= dataset_size {
                    break;
                }
            }

            visualizer.print_save(&format!(
                "End of epoch {epoch} / {last_epoch} \t Time Taken: {} sec",
                epoch_start.elapsed().as_secs()
            ))?;

            if epoch % opts.save_epoch_freq == 0 {
                visualizer.print_save(&format!(
                    "saving the model at the end of epoch {epoch}, iters {steps}"
                ))?;
                model.save("latest")?;
                model.save(&epoch.to_string())?;
                ProgressState::new(epoch + 1, 0).save(&iter_path)?;
                summary.checkpoints_written += 2;
            }

            if opts.niter_fix_global != 0 && epoch == opts.niter_fix_global {
                model.update_fixed_params();
            }
            if epoch > opts.niter {
                model.update_learning_rate();
            }
            summary.epochs_run += 1;
        }

        summary.total_steps = steps;
        summary.final_lr = model.old_lr();
        Ok(summary)
    }
}

/// Label, optional mask, generated and target images, at most [`SAMPLE_IMAGES`] of each.
pub fn sample_grid<B: Backend>(
    batch: &MappingBatch<B>,
    generated: Tensor<B, 4>,
    with_mask: bool,
) -> Tensor<B, 4> {
    let n = batch
        .batch_len()
        .min(generated.dims()[0])
        .min(SAMPLE_IMAGES);
    let mut parts = vec![batch.label.clone().narrow(0, 0, n)];
    if with_mask {
        parts.push(batch.inst.clone().narrow(0, 0, n).repeat_dim(1, 3));
    }
    parts.push(generated.narrow(0, 0, n));
    parts.push(batch.image.clone().narrow(0, 0, n));
    Tensor::cat(parts, 0)
}
