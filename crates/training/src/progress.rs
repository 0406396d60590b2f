//! Persisted training progress (`iter.txt`) and step bookkeeping.

use crate::options::TrainOptions;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Position a run resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    pub epoch: usize,
    pub epoch_iter: usize,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            epoch: 1,
            epoch_iter: 0,
        }
    }
}

impl ProgressState {
    pub fn new(epoch: usize, epoch_iter: usize) -> Self {
        Self { epoch, epoch_iter }
    }

    /// Parse two integers separated by commas and/or whitespace.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut fields = text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty());
        let mut next = |what: &str| -> anyhow::Result<usize> {
            let raw = fields
                .next()
                .with_context(|| format!("progress file is missing {what}"))?;
            raw.parse()
                .with_context(|| format!("invalid {what} {raw:?} in progress file"))
        };
        let epoch = next("epoch")?;
        let epoch_iter = next("epoch_iter")?;
        Ok(Self { epoch, epoch_iter })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{},{}\n", self.epoch, self.epoch_iter))
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Position stored by the last run: `(1, 0)` for a fresh run, otherwise the progress file
/// (falling back to `(1, 0)` when it cannot be read).
pub fn saved_position(opts: &TrainOptions, iter_path: &Path) -> ProgressState {
    if !opts.continue_train {
        return ProgressState::default();
    }
    match ProgressState::load(iter_path) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!("could not resume progress ({err:#}); starting from epoch 1, iteration 0");
            ProgressState::default()
        }
    }
}

/// Start epoch forced by `which_epoch`, for fresh and resumed runs alike.
pub fn epoch_override(opts: &TrainOptions) -> anyhow::Result<Option<usize>> {
    if opts.which_epoch == "latest" {
        return Ok(None);
    }
    let epoch = opts.which_epoch.parse().with_context(|| {
        format!(
            "which_epoch must be `latest` or an epoch number (got {:?})",
            opts.which_epoch
        )
    })?;
    Ok(Some(epoch))
}

/// Where a run starts: [`saved_position`] with the epoch replaced by [`epoch_override`].
pub fn resume_point(opts: &TrainOptions, iter_path: &Path) -> anyhow::Result<ProgressState> {
    let mut state = saved_position(opts, iter_path);
    if let Some(epoch) = epoch_override(opts)? {
        state.epoch = epoch;
    }
    Ok(state)
}

pub fn total_steps(start_epoch: usize, epoch_iter: usize, dataset_size: usize) -> usize {
    start_epoch.saturating_sub(1) * dataset_size + epoch_iter
}

/// Offsets that keep periodic actions on the same step modulus across resumed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicDeltas {
    pub print: usize,
    pub display: usize,
    pub save_latest: usize,
}

impl PeriodicDeltas {
    pub fn new(total_steps: usize, opts: &TrainOptions) -> Self {
        Self {
            print: total_steps % opts.print_freq,
            display: total_steps % opts.display_freq,
            save_latest: total_steps % opts.save_latest_freq,
        }
    }
}

/// `true` when `step` lands on the cadence `freq` shifted by `delta`.
pub fn fires(step: usize, freq: usize, delta: usize) -> bool {
    step % freq == delta
}
