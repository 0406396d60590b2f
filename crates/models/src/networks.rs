//! Generator-side networks: feature encoders/decoders and the mapping network.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Channel count of the encoder at `level` downsamplings, capped at `cap`.
pub fn channels_at(ngf: usize, level: usize, cap: usize) -> usize {
    (ngf << level).min(cap).max(1)
}

fn conv(in_ch: usize, out_ch: usize, kernel: usize, stride: usize, pad: usize) -> Conv2dConfig {
    Conv2dConfig::new([in_ch, out_ch], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
}

/// conv -> instance norm -> relu
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: InstanceNorm<B>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(cfg: Conv2dConfig, out_ch: usize, device: &B::Device) -> Self {
        Self {
            conv: cfg.init(device),
            norm: InstanceNormConfig::new(out_ch).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: InstanceNorm<B>,
    conv2: Conv2d<B>,
    norm2: InstanceNorm<B>,
}

impl<B: Backend> ResnetBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv(channels, channels, 3, 1, 1).init(device),
            norm1: InstanceNormConfig::new(channels).init(device),
            conv2: conv(channels, channels, 3, 1, 1).init(device),
            norm2: InstanceNormConfig::new(channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let y = relu(self.norm1.forward(self.conv1.forward(x.clone())));
        let y = self.norm2.forward(self.conv2.forward(y));
        x + y
    }
}

#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub input_nc: usize,
    pub output_nc: usize,
    pub ngf: usize,
    pub n_downsample: usize,
    pub n_blocks: usize,
    /// Upper bound on feature channels.
    pub max_channels: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            input_nc: 3,
            output_nc: 3,
            ngf: 64,
            n_downsample: 2,
            n_blocks: 2,
            max_channels: 256,
        }
    }
}

impl CodecConfig {
    pub fn feature_channels(&self) -> usize {
        channels_at(self.ngf, self.n_downsample, self.max_channels)
    }
}

/// Image -> latent feature map (`H / 2^n_downsample`).
#[derive(Module, Debug)]
pub struct FeatureEncoder<B: Backend> {
    stem: ConvBlock<B>,
    down: Vec<ConvBlock<B>>,
    blocks: Vec<ResnetBlock<B>>,
}

impl<B: Backend> FeatureEncoder<B> {
    pub fn new(cfg: &CodecConfig, device: &B::Device) -> Self {
        let stem_ch = channels_at(cfg.ngf, 0, cfg.max_channels);
        let stem = ConvBlock::new(conv(cfg.input_nc, stem_ch, 7, 1, 3), stem_ch, device);
        let down = (0..cfg.n_downsample)
            .map(|i| {
                let in_ch = channels_at(cfg.ngf, i, cfg.max_channels);
                let out_ch = channels_at(cfg.ngf, i + 1, cfg.max_channels);
                ConvBlock::new(conv(in_ch, out_ch, 3, 2, 1), out_ch, device)
            })
            .collect();
        let blocks = (0..cfg.n_blocks)
            .map(|_| ResnetBlock::new(cfg.feature_channels(), device))
            .collect();
        Self { stem, down, blocks }
    }

    pub fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(image);
        for block in &self.down {
            x = block.forward(x);
        }
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }
}

#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: InstanceNorm<B>,
}

impl<B: Backend> UpBlock<B> {
    fn new(in_ch: usize, out_ch: usize, device: &B::Device) -> Self {
        Self {
            conv: ConvTranspose2dConfig::new([in_ch, out_ch], [3, 3])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_padding_out([1, 1])
                .init(device),
            norm: InstanceNormConfig::new(out_ch).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Latent feature map -> image in [-1, 1].
#[derive(Module, Debug)]
pub struct FeatureDecoder<B: Backend> {
    blocks: Vec<ResnetBlock<B>>,
    up: Vec<UpBlock<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> FeatureDecoder<B> {
    pub fn new(cfg: &CodecConfig, device: &B::Device) -> Self {
        let blocks = (0..cfg.n_blocks)
            .map(|_| ResnetBlock::new(cfg.feature_channels(), device))
            .collect();
        let up = (0..cfg.n_downsample)
            .rev()
            .map(|i| {
                let in_ch = channels_at(cfg.ngf, i + 1, cfg.max_channels);
                let out_ch = channels_at(cfg.ngf, i, cfg.max_channels);
                UpBlock::new(in_ch, out_ch, device)
            })
            .collect();
        let head_in = channels_at(cfg.ngf, 0, cfg.max_channels);
        let head = conv(head_in, cfg.output_nc, 7, 1, 3).init(device);
        Self { blocks, up, head }
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = features;
        for block in &self.blocks {
            x = block.forward(x);
        }
        for block in &self.up {
            x = block.forward(x);
        }
        tanh(self.head.forward(x))
    }
}

#[derive(Debug, Clone)]
pub struct MappingNetConfig {
    pub feature_channels: usize,
    pub mapping_channels: usize,
    pub n_blocks: usize,
}

/// Translates degraded-domain features into clean-domain features.
#[derive(Module, Debug)]
pub struct MappingNet<B: Backend> {
    entry: Vec<ConvBlock<B>>,
    blocks: Vec<ResnetBlock<B>>,
    exit: Conv2d<B>,
}

impl<B: Backend> MappingNet<B> {
    pub fn new(cfg: &MappingNetConfig, device: &B::Device) -> Self {
        let mc = cfg.mapping_channels.max(1);
        let entry = vec![
            ConvBlock::new(conv(cfg.feature_channels, mc, 3, 1, 1), mc, device),
            ConvBlock::new(conv(mc, mc, 3, 1, 1), mc, device),
        ];
        let blocks = (0..cfg.n_blocks)
            .map(|_| ResnetBlock::new(mc, device))
            .collect();
        let exit = conv(mc, cfg.feature_channels, 3, 1, 1).init(device);
        Self {
            entry,
            blocks,
            exit,
        }
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = features;
        for block in &self.entry {
            x = block.forward(x);
        }
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.exit.forward(x)
    }
}

/// The trainable half of the generator: mapping network plus the clean-domain decoder.
#[derive(Module, Debug)]
pub struct MappingGenerator<B: Backend> {
    pub mapping: MappingNet<B>,
    pub decoder: FeatureDecoder<B>,
}

impl<B: Backend> MappingGenerator<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let mapped = self.mapping.forward(features);
        let image = self.decoder.forward(mapped.clone());
        (mapped, image)
    }
}
