//! Multi-scale PatchGAN discriminator that exposes intermediate features.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

const KERNEL: usize = 4;
const PAD: usize = 2;
const SLOPE: f64 = 0.2;
const MAX_CHANNELS: usize = 512;

#[derive(Debug, Clone)]
pub struct DiscriminatorConfig {
    pub input_nc: usize,
    pub ndf: usize,
    pub n_layers: usize,
    pub num_d: usize,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            input_nc: 6,
            ndf: 64,
            n_layers: 3,
            num_d: 2,
        }
    }
}

#[derive(Module, Debug)]
pub struct DiscLayer<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<InstanceNorm<B>>,
}

impl<B: Backend> DiscLayer<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, norm: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_ch, out_ch], [KERNEL, KERNEL])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(PAD, PAD))
            .init(device);
        let norm = norm.then(|| InstanceNormConfig::new(out_ch).init(device));
        Self { conv, norm }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        leaky_relu(x, SLOPE)
    }
}

/// Single-scale PatchGAN; the last element of `forward` is the patch prediction.
#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    layers: Vec<DiscLayer<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> PatchDiscriminator<B> {
    pub fn new(cfg: &DiscriminatorConfig, device: &B::Device) -> Self {
        let mut layers = Vec::with_capacity(cfg.n_layers + 1);
        let mut nf = cfg.ndf.max(1);
        layers.push(DiscLayer::new(cfg.input_nc, nf, 2, false, device));
        for _ in 1..cfg.n_layers.max(1) {
            let prev = nf;
            nf = (nf * 2).min(MAX_CHANNELS);
            layers.push(DiscLayer::new(prev, nf, 2, true, device));
        }
        let prev = nf;
        nf = (nf * 2).min(MAX_CHANNELS);
        layers.push(DiscLayer::new(prev, nf, 1, true, device));
        let head = Conv2dConfig::new([nf, 1], [KERNEL, KERNEL])
            .with_padding(PaddingConfig2d::Explicit(PAD, PAD))
            .init(device);
        Self { layers, head }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut outputs = Vec::with_capacity(self.layers.len() + 1);
        let mut x = input;
        for layer in &self.layers {
            x = layer.forward(x);
            outputs.push(x.clone());
        }
        outputs.push(self.head.forward(x));
        outputs
    }
}

#[derive(Module, Debug)]
pub struct MultiscaleDiscriminator<B: Backend> {
    scales: Vec<PatchDiscriminator<B>>,
    downsample: AvgPool2d,
}

impl<B: Backend> MultiscaleDiscriminator<B> {
    pub fn new(cfg: &DiscriminatorConfig, device: &B::Device) -> Self {
        let scales = (0..cfg.num_d.max(1))
            .map(|_| PatchDiscriminator::new(cfg, device))
            .collect();
        let downsample = AvgPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_count_include_pad(false)
            .init();
        Self { scales, downsample }
    }

    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }

    /// Features per scale, full resolution first.
    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<Vec<Tensor<B, 4>>> {
        let mut results = Vec::with_capacity(self.scales.len());
        let mut x = input;
        for (i, scale) in self.scales.iter().enumerate() {
            if i > 0 {
                x = self.downsample.forward(x);
            }
            results.push(scale.forward(x.clone()));
        }
        results
    }
}
