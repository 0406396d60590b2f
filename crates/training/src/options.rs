use anyhow::Context;
use clap::{ArgAction, Parser};
use models::{CodecConfig, MappingModelConfig};
use photo_dataset::DatasetConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Serialize, Deserialize, Debug, Clone)]
#[command(
    name = "train_mapping",
    about = "Train the latent mapping network that restores old photos"
)]
#[serde(default)]
pub struct TrainOptions {
    /// Load every option from this TOML file instead of the command line.
    #[arg(long)]
    #[serde(skip)]
    pub options_file: Option<PathBuf>,

    // Run identity and persistence.
    /// Name of the experiment; checkpoints land in `<checkpoints_dir>/<name>`.
    #[arg(long, default_value = "mapping")]
    pub name: String,
    #[arg(long, default_value = "./checkpoints")]
    pub checkpoints_dir: PathBuf,
    /// Root for sample grids; images land in `<outputs_dir>/<name>`.
    #[arg(long, default_value = "./outputs")]
    pub outputs_dir: PathBuf,
    /// Resume from the progress file and the `which_epoch` checkpoint.
    #[arg(long)]
    pub continue_train: bool,
    /// Checkpoint tag to resume from: `latest` or an epoch number.
    #[arg(long, default_value = "latest")]
    pub which_epoch: String,
    /// Comma separated device ids, `-1` for CPU.
    #[arg(long, default_value = "0")]
    pub gpu_ids: String,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub is_train: bool,

    // Data.
    /// Directory containing train_A, train_B and optionally train_mask.
    #[arg(long, default_value = "./datasets")]
    pub dataroot: PathBuf,
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
    /// Square side images are resized to.
    #[arg(long, default_value_t = 256)]
    pub load_size: u32,
    /// Disable random horizontal flips.
    #[arg(long)]
    pub no_flip: bool,
    /// Keep the on-disk order instead of reshuffling every epoch.
    #[arg(long)]
    pub serial_batches: bool,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Feed the defect mask to the sample grid.
    #[arg(long)]
    pub nl_use_mask: bool,

    // Cadence.
    /// Steps between sample grids.
    #[arg(long, default_value_t = 100)]
    pub display_freq: usize,
    /// Steps between loss log lines.
    #[arg(long, default_value_t = 100)]
    pub print_freq: usize,
    /// Steps between mid-epoch `latest` checkpoints.
    #[arg(long, default_value_t = 10000)]
    pub save_latest_freq: usize,
    /// Epochs between numbered checkpoints.
    #[arg(long, default_value_t = 1)]
    pub save_epoch_freq: usize,

    // Schedule.
    /// Epochs at the starting learning rate.
    #[arg(long, default_value_t = 100)]
    pub niter: usize,
    /// Epochs over which the learning rate decays linearly to zero.
    #[arg(long, default_value_t = 100)]
    pub niter_decay: usize,
    /// Epoch after which the clean-domain decoder is trained too (0 = never).
    #[arg(long, default_value_t = 0)]
    pub niter_fix_global: usize,
    #[arg(long, default_value_t = 2e-4)]
    pub lr: f64,
    #[arg(long, default_value_t = 0.5)]
    pub beta1: f64,

    // Networks.
    #[arg(long, default_value_t = 64)]
    pub ngf: usize,
    #[arg(long, default_value_t = 64)]
    pub ndf: usize,
    #[arg(long, default_value_t = 3)]
    pub n_downsample: usize,
    /// Residual blocks in each encoder and decoder.
    #[arg(long, default_value_t = 2)]
    pub n_blocks: usize,
    /// Residual blocks in the mapping network.
    #[arg(long, default_value_t = 3)]
    pub mapping_blocks: usize,
    /// Channel cap for the encoder and decoder feature maps.
    #[arg(long, default_value_t = 256)]
    pub max_channels: usize,
    /// Width of the mapping network's hidden layers.
    #[arg(long, default_value_t = 256)]
    pub mapping_channels: usize,
    #[arg(long, default_value_t = 2)]
    pub num_d: usize,
    #[arg(long, default_value_t = 3)]
    pub n_layers_d: usize,
    /// Skip the degraded-domain encoder in the model summary.
    #[arg(long)]
    pub use_skip_model: bool,
    /// Pretrained degraded-domain codec directory.
    #[arg(long)]
    pub load_pretrain_a: Option<PathBuf>,
    /// Pretrained clean-domain codec directory.
    #[arg(long)]
    pub load_pretrain_b: Option<PathBuf>,

    // Losses.
    /// Unconditional discriminator (image only).
    #[arg(long)]
    pub no_cgan: bool,
    #[arg(long)]
    pub no_gan_feat_loss: bool,
    #[arg(long, default_value_t = 10.0)]
    pub lambda_feat: f32,
    /// Weight of the latent L2 loss.
    #[arg(long, default_value_t = 60.0)]
    pub l2_feat: f32,
    /// Add a smooth-L1 image loss.
    #[arg(long)]
    pub smooth_l1: bool,
    #[arg(long, default_value_t = 10.0)]
    pub l1_weight: f32,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self::parse_from(["train_mapping"])
    }
}

impl TrainOptions {
    /// Replace the command-line values with the TOML options file, when one was given.
    pub fn resolve(self) -> anyhow::Result<Self> {
        let Some(path) = self.options_file.clone() else {
            return Ok(self);
        };
        let mut opts = Self::from_toml_file(&path)?;
        opts.options_file = Some(path);
        Ok(opts)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read options file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse options file {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("print_freq", self.print_freq),
            ("display_freq", self.display_freq),
            ("save_latest_freq", self.save_latest_freq),
            ("save_epoch_freq", self.save_epoch_freq),
            ("niter", self.niter),
            ("max_channels", self.max_channels),
            ("mapping_channels", self.mapping_channels),
        ] {
            anyhow::ensure!(value >= 1, "{name} must be at least 1 (got {value})");
        }
        anyhow::ensure!(self.load_size >= 1, "load_size must be at least 1");
        anyhow::ensure!(self.lr >= 0.0, "lr must not be negative (got {})", self.lr);
        self.gpu_ids()?;
        Ok(())
    }

    /// Parsed device ids; CPU (negative) ids are dropped.
    pub fn gpu_ids(&self) -> anyhow::Result<Vec<usize>> {
        let mut ids = Vec::new();
        for raw in self.gpu_ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let id: i64 = raw
                .parse()
                .with_context(|| format!("invalid gpu id {raw:?} in {:?}", self.gpu_ids))?;
            if id >= 0 {
                ids.push(id as usize);
            }
        }
        Ok(ids)
    }

    /// `<checkpoints_dir>/<name>`
    pub fn expr_dir(&self) -> PathBuf {
        self.checkpoints_dir.join(&self.name)
    }

    /// `<outputs_dir>/<name>`
    pub fn sample_dir(&self) -> PathBuf {
        self.outputs_dir.join(&self.name)
    }

    pub fn iter_path(&self) -> PathBuf {
        self.expr_dir().join("iter.txt")
    }

    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            load_size: self.load_size,
            flip_horizontal_prob: if self.no_flip { 0.0 } else { 0.5 },
            shuffle: !self.serial_batches,
            seed: self.seed,
        }
    }

    pub fn model_config(&self) -> MappingModelConfig {
        MappingModelConfig {
            codec: CodecConfig {
                ngf: self.ngf,
                n_downsample: self.n_downsample,
                n_blocks: self.n_blocks,
                max_channels: self.max_channels,
                ..CodecConfig::default()
            },
            mapping_channels: self.mapping_channels,
            mapping_blocks: self.mapping_blocks,
            ndf: self.ndf,
            n_layers_d: self.n_layers_d,
            num_d: self.num_d,
            no_cgan: self.no_cgan,
            no_gan_feat_loss: self.no_gan_feat_loss,
            lambda_feat: self.lambda_feat,
            l2_feat: self.l2_feat,
            smooth_l1: self.smooth_l1,
            l1_weight: self.l1_weight,
            lr: self.lr,
            beta1: self.beta1,
            niter_decay: self.niter_decay,
            save_dir: self.expr_dir(),
            resume_tag: self.continue_train.then(|| self.which_epoch.clone()),
            pretrain_a: self.load_pretrain_a.clone(),
            pretrain_b: self.load_pretrain_b.clone(),
        }
    }

    /// `key: value` dump, sorted by key.
    pub fn to_text(&self) -> anyhow::Result<String> {
        let value = serde_json::to_value(self).context("failed to serialize options")?;
        let mut out = String::from("------------ Options -------------\n");
        if let serde_json::Value::Object(map) = value {
            for (key, value) in map {
                let rendered = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => "None".to_string(),
                    other => other.to_string(),
                };
                out.push_str(&format!("{key}: {rendered}\n"));
            }
        }
        out.push_str("-------------- End ----------------\n");
        Ok(out)
    }

    /// Write `opt.txt` into the experiment directory.
    pub fn save_text(&self) -> anyhow::Result<PathBuf> {
        let dir = self.expr_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join("opt.txt");
        fs::write(&path, self.to_text()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_command_line() {
        let opts = TrainOptions::default();
        assert_eq!(opts.which_epoch, "latest");
        assert_eq!(opts.batch_size, 1);
        assert!(opts.is_train);
        assert!(!opts.continue_train);
        opts.validate().unwrap();
    }

    #[test]
    fn zero_frequencies_are_rejected() {
        let opts = TrainOptions {
            print_freq: 0,
            ..TrainOptions::default()
        };
        let err = opts.validate().unwrap_err().to_string();
        assert!(err.contains("print_freq"), "{err}");
    }

    #[test]
    fn network_widths_reach_the_model_config() {
        let opts = TrainOptions {
            max_channels: 8,
            mapping_channels: 4,
            ..TrainOptions::default()
        };
        let cfg = opts.model_config();
        assert_eq!(cfg.codec.max_channels, 8);
        assert_eq!(cfg.mapping_channels, 4);
        assert_eq!(TrainOptions::default().model_config().mapping_channels, 256);

        let zero = TrainOptions {
            mapping_channels: 0,
            ..TrainOptions::default()
        };
        let err = zero.validate().unwrap_err().to_string();
        assert!(err.contains("mapping_channels"), "{err}");
    }

    #[test]
    fn gpu_ids_drop_cpu_marker() {
        let mut opts = TrainOptions::default();
        opts.gpu_ids = "-1".into();
        assert!(opts.gpu_ids().unwrap().is_empty());
        opts.gpu_ids = "0, 2".into();
        assert_eq!(opts.gpu_ids().unwrap(), vec![0, 2]);
        opts.gpu_ids = "zero".into();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn toml_file_fills_missing_keys_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("opts.toml");
        fs::write(&path, "name = \"restore\"\nbatch_size = 4\ncontinue_train = true\n").unwrap();
        let opts = TrainOptions {
            options_file: Some(path),
            ..TrainOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(opts.name, "restore");
        assert_eq!(opts.batch_size, 4);
        assert!(opts.continue_train);
        assert_eq!(opts.niter, 100);
        assert_eq!(opts.model_config().resume_tag.as_deref(), Some("latest"));
    }

    #[test]
    fn opt_txt_lists_every_field() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = TrainOptions {
            checkpoints_dir: tmp.path().to_path_buf(),
            ..TrainOptions::default()
        };
        let path = opts.save_text().unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.starts_with("------------ Options -------------"));
        assert!(text.contains("name: mapping\n"));
        assert!(text.contains("niter_fix_global: 0\n"));
        assert!(text.contains("load_pretrain_a: None\n"));
    }
}
