//! Loss values and the loss terms of the mapping GAN.

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

/// One entry of the model's loss list.
///
/// `Tensor` may hold one value per device; `Constant` stands in for a term that is switched off.
#[derive(Debug, Clone)]
pub enum LossValue<B: Backend> {
    Tensor(Tensor<B, 1>),
    Constant(f32),
}

impl<B: Backend> LossValue<B> {
    pub fn zero() -> Self {
        LossValue::Constant(0.0)
    }

    /// Average per-device entries down to one element; constants are left alone.
    pub fn reduce_mean(self) -> Self {
        match self {
            LossValue::Tensor(t) if t.dims()[0] > 1 => LossValue::Tensor(t.mean()),
            other => other,
        }
    }

    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (LossValue::Tensor(a), LossValue::Tensor(b)) => LossValue::Tensor(a + b),
            (LossValue::Tensor(t), LossValue::Constant(c))
            | (LossValue::Constant(c), LossValue::Tensor(t)) => {
                if c == 0.0 {
                    LossValue::Tensor(t)
                } else {
                    LossValue::Tensor(t.add_scalar(c))
                }
            }
            (LossValue::Constant(a), LossValue::Constant(b)) => LossValue::Constant(a + b),
        }
    }

    pub fn scale(self, factor: f32) -> Self {
        match self {
            LossValue::Tensor(t) => LossValue::Tensor(t.mul_scalar(factor)),
            LossValue::Constant(c) => LossValue::Constant(c * factor),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, LossValue::Constant(_))
    }

    /// Host-side value (mean of the entries for a multi-device tensor).
    pub fn value(&self) -> f32 {
        match self {
            LossValue::Tensor(t) => scalar_of(t.clone().mean()),
            LossValue::Constant(c) => *c,
        }
    }

    pub fn into_tensor(self) -> Option<Tensor<B, 1>> {
        match self {
            LossValue::Tensor(t) => Some(t),
            LossValue::Constant(_) => None,
        }
    }
}

impl<B: AutodiffBackend> LossValue<B> {
    pub fn detach(self) -> Self {
        match self {
            LossValue::Tensor(t) => LossValue::Tensor(t.detach()),
            other => other,
        }
    }
}

/// First element of a tensor as `f32`, zero if it cannot be read.
pub fn scalar_of<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f32 {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(0.0)
}

/// Least-squares GAN loss summed over discriminator scales.
pub fn gan_loss<B: Backend>(predictions: &[Vec<Tensor<B, 4>>], target_is_real: bool) -> Tensor<B, 1> {
    let mse = MseLoss::new();
    let mut total: Option<Tensor<B, 1>> = None;
    for scale in predictions {
        let Some(pred) = scale.last() else {
            continue;
        };
        let target = if target_is_real {
            pred.ones_like()
        } else {
            pred.zeros_like()
        };
        let loss = mse.forward(pred.clone(), target, Reduction::Mean);
        total = Some(match total {
            Some(acc) => acc + loss,
            None => loss,
        });
    }
    total.unwrap_or_else(|| Tensor::zeros([1], &Default::default()))
}

/// L1 distance between discriminator features of fake and (detached) real inputs,
/// weighted per layer by `4 / (n_layers + 1)` and per scale by `1 / num_scales`.
pub fn feature_matching_loss<B: Backend>(
    pred_fake: &[Vec<Tensor<B, 4>>],
    pred_real: &[Vec<Tensor<B, 4>>],
    n_layers: usize,
    lambda_feat: f32,
) -> Tensor<B, 1> {
    let feat_weight = 4.0 / (n_layers as f32 + 1.0);
    let scale_weight = 1.0 / pred_fake.len().max(1) as f32;
    let mut total: Option<Tensor<B, 1>> = None;
    for (fake, real) in pred_fake.iter().zip(pred_real) {
        // Skip the final prediction map; only intermediate features are matched.
        let layers = fake.len().saturating_sub(1).min(real.len());
        for j in 0..layers {
            let l1 = (fake[j].clone() - real[j].clone()).abs().mean();
            let term = l1.mul_scalar(scale_weight * feat_weight * lambda_feat);
            total = Some(match total {
                Some(acc) => acc + term,
                None => term,
            });
        }
    }
    total.unwrap_or_else(|| Tensor::zeros([1], &Default::default()))
}

/// Mean squared error between two feature maps.
pub fn feature_l2_loss<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
    MseLoss::new().forward(a, b, Reduction::Mean)
}

/// Huber loss with unit threshold, averaged over all elements.
pub fn smooth_l1_loss<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    let diff = (pred - target).abs();
    let quadratic = diff.clone().clamp_max(1.0);
    let linear = diff - quadratic.clone();
    (quadratic.clone() * quadratic * 0.5 + linear).mean()
}
