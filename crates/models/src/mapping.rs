//! The pix2pixHD-style mapping model: frozen domain encoders, a trainable mapping network and
//! decoder, and a multi-scale discriminator, each with its own Adam optimizer.

use crate::discriminator::{DiscriminatorConfig, MultiscaleDiscriminator};
use crate::loss::{
    feature_l2_loss, feature_matching_loss, gan_loss, scalar_of, smooth_l1_loss, LossValue,
};
use crate::networks::{
    CodecConfig, FeatureDecoder, FeatureEncoder, MappingGenerator, MappingNet, MappingNetConfig,
};
use crate::ModelError;
use burn::module::Module;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use photo_dataset::MappingBatch;
use std::path::{Path, PathBuf};

/// Names of the loss list returned by [`MappingModel::forward`], in order.
pub const LOSS_NAMES: [&str; 7] = [
    "G_Feat_L2",
    "G_GAN",
    "G_GAN_Feat",
    "G_VGG",
    "D_real",
    "D_fake",
    "Smooth_L1",
];

/// Result of one forward pass.
#[derive(Debug)]
pub struct ForwardOutput<B: AutodiffBackend> {
    /// `None` asks the caller to skip this batch.
    pub losses: Option<Vec<LossValue<B>>>,
    /// Generated images, only when inference output was requested.
    pub generated: Option<Tensor<B, 4>>,
}

/// What the training loop needs from a model.
pub trait MappingModel<B: AutodiffBackend> {
    /// Names matching the positions of the loss list.
    fn loss_names(&self) -> Vec<String>;
    fn forward(&mut self, batch: &MappingBatch<B>, infer: bool)
        -> Result<ForwardOutput<B>, ModelError>;
    /// Backpropagate the generator objective and step the mapping optimizer.
    fn optimize_mapping(&mut self, loss_g: LossValue<B>);
    /// Backpropagate the discriminator objective and step the discriminator optimizer.
    fn optimize_discriminator(&mut self, loss_d: LossValue<B>);
    /// Current learning rate.
    fn old_lr(&self) -> f64;
    fn save(&self, tag: &str) -> Result<(), ModelError>;
    /// Start training the networks that were held fixed so far.
    fn update_fixed_params(&mut self);
    fn update_learning_rate(&mut self);
    /// Human-readable network summary.
    fn describe(&self, use_skip_model: bool) -> String;
}

#[derive(Debug, Clone)]
pub struct MappingModelConfig {
    pub codec: CodecConfig,
    pub mapping_channels: usize,
    pub mapping_blocks: usize,
    pub ndf: usize,
    pub n_layers_d: usize,
    pub num_d: usize,
    /// Discriminate the image alone instead of `(label, image)`.
    pub no_cgan: bool,
    pub no_gan_feat_loss: bool,
    pub lambda_feat: f32,
    pub l2_feat: f32,
    pub smooth_l1: bool,
    pub l1_weight: f32,
    pub lr: f64,
    pub beta1: f64,
    pub niter_decay: usize,
    /// Directory checkpoints are written to and resumed from.
    pub save_dir: PathBuf,
    /// Checkpoint tag to resume from, if any.
    pub resume_tag: Option<String>,
    /// Directory holding `latest_net_encoder` for the degraded domain.
    pub pretrain_a: Option<PathBuf>,
    /// Directory holding `latest_net_encoder`/`latest_net_decoder` for the clean domain.
    pub pretrain_b: Option<PathBuf>,
}

impl Default for MappingModelConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            mapping_channels: 256,
            mapping_blocks: 4,
            ndf: 64,
            n_layers_d: 3,
            num_d: 2,
            no_cgan: false,
            no_gan_feat_loss: false,
            lambda_feat: 10.0,
            l2_feat: 60.0,
            smooth_l1: false,
            l1_weight: 10.0,
            lr: 2e-4,
            beta1: 0.5,
            niter_decay: 100,
            save_dir: PathBuf::from("checkpoints/mapping"),
            resume_tag: None,
            pretrain_a: None,
            pretrain_b: None,
        }
    }
}

type Recorder = BinFileRecorder<FullPrecisionSettings>;

fn checkpoint_path(dir: &Path, tag: &str, net: &str) -> PathBuf {
    dir.join(format!("{tag}_net_{net}"))
}

/// Load `module` from `path` if a recorder file exists there, otherwise keep it as is.
fn load_if_present<B: AutodiffBackend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, ModelError> {
    let file = path.with_extension("bin");
    if !file.exists() {
        tracing::warn!("{} not exists yet!", file.display());
        return Ok(module);
    }
    let recorder = Recorder::new();
    let loaded = module
        .load_file(path, &recorder, device)
        .map_err(|source| ModelError::Checkpoint {
            path: file.clone(),
            source,
        })?;
    tracing::info!("loaded {}", file.display());
    Ok(loaded)
}

pub struct Pix2PixHdMapping<B: AutodiffBackend, OG, OD> {
    cfg: MappingModelConfig,
    encoder_a: FeatureEncoder<B>,
    encoder_b: FeatureEncoder<B>,
    generator: MappingGenerator<B>,
    discriminator: MultiscaleDiscriminator<B>,
    optimizer_mapping: OG,
    optimizer_d: OD,
    old_lr: f64,
    train_global: bool,
}

/// Build the networks, load pretrained/resumed weights and set up both Adam optimizers.
#[allow(clippy::type_complexity)]
pub fn build_mapping_model<B: AutodiffBackend>(
    cfg: MappingModelConfig,
    device: &B::Device,
) -> Result<
    Pix2PixHdMapping<
        B,
        impl Optimizer<MappingGenerator<B>, B>,
        impl Optimizer<MultiscaleDiscriminator<B>, B>,
    >,
    ModelError,
> {
    let codec = &cfg.codec;
    let mut encoder_a = FeatureEncoder::new(codec, device);
    let mut encoder_b = FeatureEncoder::new(codec, device);
    let mut decoder = FeatureDecoder::new(codec, device);
    let mut mapping = MappingNet::new(
        &MappingNetConfig {
            feature_channels: codec.feature_channels(),
            mapping_channels: cfg.mapping_channels,
            n_blocks: cfg.mapping_blocks,
        },
        device,
    );
    let d_input = if cfg.no_cgan {
        codec.output_nc
    } else {
        codec.input_nc + codec.output_nc
    };
    let mut discriminator = MultiscaleDiscriminator::new(
        &DiscriminatorConfig {
            input_nc: d_input,
            ndf: cfg.ndf,
            n_layers: cfg.n_layers_d,
            num_d: cfg.num_d,
        },
        device,
    );

    match &cfg.pretrain_a {
        Some(dir) => {
            encoder_a = load_if_present(encoder_a, &checkpoint_path(dir, "latest", "encoder"), device)?;
        }
        None => tracing::warn!("no pretrained degraded-domain encoder given; using random init"),
    }
    match &cfg.pretrain_b {
        Some(dir) => {
            encoder_b = load_if_present(encoder_b, &checkpoint_path(dir, "latest", "encoder"), device)?;
            decoder = load_if_present(decoder, &checkpoint_path(dir, "latest", "decoder"), device)?;
        }
        None => tracing::warn!("no pretrained clean-domain codec given; using random init"),
    }
    if let Some(tag) = &cfg.resume_tag {
        let dir = &cfg.save_dir;
        mapping = load_if_present(mapping, &checkpoint_path(dir, tag, "mapping"), device)?;
        decoder = load_if_present(decoder, &checkpoint_path(dir, tag, "decoder"), device)?;
        discriminator = load_if_present(discriminator, &checkpoint_path(dir, tag, "D"), device)?;
    }

    let optimizer_mapping = AdamConfig::new()
        .with_beta_1(cfg.beta1 as f32)
        .with_beta_2(0.999)
        .init::<B, MappingGenerator<B>>();
    let optimizer_d = AdamConfig::new()
        .with_beta_1(cfg.beta1 as f32)
        .with_beta_2(0.999)
        .init::<B, MultiscaleDiscriminator<B>>();

    Ok(Pix2PixHdMapping {
        old_lr: cfg.lr,
        encoder_a: encoder_a.no_grad(),
        encoder_b: encoder_b.no_grad(),
        generator: MappingGenerator { mapping, decoder },
        discriminator,
        optimizer_mapping,
        optimizer_d,
        train_global: false,
        cfg,
    })
}

impl<B, OG, OD> Pix2PixHdMapping<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<MappingGenerator<B>, B>,
    OD: Optimizer<MultiscaleDiscriminator<B>, B>,
{
    pub fn config(&self) -> &MappingModelConfig {
        &self.cfg
    }

    pub fn is_training_global(&self) -> bool {
        self.train_global
    }

    fn discriminator_input(&self, label: &Tensor<B, 4>, image: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.cfg.no_cgan {
            image
        } else {
            Tensor::cat(vec![label.clone(), image], 1)
        }
    }

    fn is_degenerate(batch: &MappingBatch<B>) -> bool {
        if batch.batch_len() == 0 {
            return true;
        }
        let checksum = scalar_of(batch.label.clone().abs().sum()) + scalar_of(batch.image.clone().abs().sum());
        !checksum.is_finite()
    }
}

impl<B, OG, OD> MappingModel<B> for Pix2PixHdMapping<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<MappingGenerator<B>, B>,
    OD: Optimizer<MultiscaleDiscriminator<B>, B>,
{
    fn loss_names(&self) -> Vec<String> {
        LOSS_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn forward(
        &mut self,
        batch: &MappingBatch<B>,
        infer: bool,
    ) -> Result<ForwardOutput<B>, ModelError> {
        if Self::is_degenerate(batch) {
            return Ok(ForwardOutput {
                losses: None,
                generated: None,
            });
        }
        let label = batch.label.clone();
        let image = batch.image.clone();

        let label_feat = self.encoder_a.forward(label.clone()).detach();
        let target_feat = self.encoder_b.forward(image.clone()).detach();
        let (mapped, fake) = self.generator.forward(label_feat);
        if fake.dims() != image.dims() {
            return Err(ModelError::Shape(format!(
                "generated {:?} vs target {:?}; image side must be divisible by {}",
                fake.dims(),
                image.dims(),
                1usize << self.cfg.codec.n_downsample
            )));
        }

        let loss_feat_l2 = feature_l2_loss(mapped, target_feat).mul_scalar(self.cfg.l2_feat);

        // Discriminator terms: the fake is detached so only D parameters see these gradients.
        let pred_fake_pool = self
            .discriminator
            .forward(self.discriminator_input(&label, fake.clone().detach()));
        let loss_d_fake = gan_loss(&pred_fake_pool, false);
        let pred_real = self
            .discriminator
            .forward(self.discriminator_input(&label, image.clone()));
        let loss_d_real = gan_loss(&pred_real, true);

        // Generator terms go through a gradient-free copy of D.
        let frozen_d = self.discriminator.clone().no_grad();
        let pred_fake = frozen_d.forward(self.discriminator_input(&label, fake.clone()));
        let loss_g_gan = gan_loss(&pred_fake, true);

        let loss_g_gan_feat = if self.cfg.no_gan_feat_loss {
            LossValue::zero()
        } else {
            let real_features: Vec<Vec<Tensor<B, 4>>> = pred_real
                .iter()
                .map(|scale| scale.iter().map(|t| t.clone().detach()).collect())
                .collect();
            LossValue::Tensor(feature_matching_loss(
                &pred_fake,
                &real_features,
                self.cfg.n_layers_d,
                self.cfg.lambda_feat,
            ))
        };

        let loss_smooth_l1 = if self.cfg.smooth_l1 {
            LossValue::Tensor(smooth_l1_loss(fake.clone(), image).mul_scalar(self.cfg.l1_weight))
        } else {
            LossValue::zero()
        };

        let losses = vec![
            LossValue::Tensor(loss_feat_l2),
            LossValue::Tensor(loss_g_gan),
            loss_g_gan_feat,
            // No perceptual network ships with this model.
            LossValue::zero(),
            LossValue::Tensor(loss_d_real),
            LossValue::Tensor(loss_d_fake),
            loss_smooth_l1,
        ];
        Ok(ForwardOutput {
            losses: Some(losses),
            generated: infer.then(|| fake.detach()),
        })
    }

    fn optimize_mapping(&mut self, loss_g: LossValue<B>) {
        let Some(loss) = loss_g.into_tensor() else {
            return;
        };
        let grads = loss.backward();
        let grads = if self.train_global {
            GradientsParams::from_grads(grads, &self.generator)
        } else {
            GradientsParams::from_grads(grads, &self.generator.mapping)
        };
        self.generator = self
            .optimizer_mapping
            .step(self.old_lr, self.generator.clone(), grads);
    }

    fn optimize_discriminator(&mut self, loss_d: LossValue<B>) {
        let Some(loss) = loss_d.into_tensor() else {
            return;
        };
        let grads = GradientsParams::from_grads(loss.backward(), &self.discriminator);
        self.discriminator = self
            .optimizer_d
            .step(self.old_lr, self.discriminator.clone(), grads);
    }

    fn old_lr(&self) -> f64 {
        self.old_lr
    }

    fn save(&self, tag: &str) -> Result<(), ModelError> {
        std::fs::create_dir_all(&self.cfg.save_dir).map_err(|source| ModelError::Io {
            path: self.cfg.save_dir.clone(),
            source,
        })?;
        let recorder = Recorder::new();
        let dir = &self.cfg.save_dir;
        let check = |result: Result<(), burn::record::RecorderError>, net: &str| {
            result.map_err(|source| ModelError::Checkpoint {
                path: checkpoint_path(dir, tag, net).with_extension("bin"),
                source,
            })
        };
        check(
            self.generator
                .mapping
                .clone()
                .save_file(checkpoint_path(dir, tag, "mapping"), &recorder),
            "mapping",
        )?;
        check(
            self.generator
                .decoder
                .clone()
                .save_file(checkpoint_path(dir, tag, "decoder"), &recorder),
            "decoder",
        )?;
        check(
            self.discriminator
                .clone()
                .save_file(checkpoint_path(dir, tag, "D"), &recorder),
            "D",
        )?;
        Ok(())
    }

    fn update_fixed_params(&mut self) {
        if self.train_global {
            return;
        }
        self.train_global = true;
        tracing::info!("------------ Now also finetuning the clean-domain decoder -----------");
    }

    fn update_learning_rate(&mut self) {
        if self.cfg.niter_decay == 0 {
            return;
        }
        let lrd = self.cfg.lr / self.cfg.niter_decay as f64;
        let lr = (self.old_lr - lrd).max(0.0);
        tracing::info!("update learning rate: {:.6} -> {:.6}", self.old_lr, lr);
        self.old_lr = lr;
    }

    fn describe(&self, use_skip_model: bool) -> String {
        let mut out = String::new();
        if !use_skip_model {
            out.push_str(&format!(
                "FeatureEncoder (degraded domain): {} parameters, {} downsamplings, {} residual blocks\n",
                self.encoder_a.num_params(),
                self.cfg.codec.n_downsample,
                self.cfg.codec.n_blocks
            ));
            out.push_str(&format!("{}\n", self.encoder_a));
        }
        out.push_str(&format!(
            "MappingNet: {} parameters, {} channels, {} residual blocks\n",
            self.generator.mapping.num_params(),
            self.cfg.mapping_channels,
            self.cfg.mapping_blocks
        ));
        out.push_str(&format!("{}\n", self.generator.mapping));
        out
    }
}

