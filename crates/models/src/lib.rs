//! Burn networks for restoring old photos with a latent-space mapping GAN.
//!
//! This crate defines:
//! - `FeatureEncoder`/`FeatureDecoder`: per-domain codecs between images and latent feature maps.
//! - `MappingNet`: translates degraded-domain features into clean-domain features.
//! - `MultiscaleDiscriminator`: PatchGAN judge that also exposes features for feature matching.
//! - `Pix2PixHdMapping`: the trainable model, implementing the `MappingModel` contract the
//!   training loop drives.

use std::path::PathBuf;
use thiserror::Error;

pub mod discriminator;
pub mod loss;
pub mod mapping;
pub mod networks;

pub use discriminator::{DiscriminatorConfig, MultiscaleDiscriminator, PatchDiscriminator};
pub use loss::LossValue;
pub use mapping::{
    build_mapping_model, ForwardOutput, MappingModel, MappingModelConfig, Pix2PixHdMapping,
    LOSS_NAMES,
};
pub use networks::{
    CodecConfig, FeatureDecoder, FeatureEncoder, MappingGenerator, MappingNet, MappingNetConfig,
    ResnetBlock,
};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("checkpoint {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: burn::record::RecorderError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shape mismatch: {0}")]
    Shape(String),
}

pub mod prelude {
    pub use super::{
        build_mapping_model, LossValue, MappingModel, MappingModelConfig, Pix2PixHdMapping,
    };
}
