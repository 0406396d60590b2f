//! Resize/flip/normalize pipeline applied identically to every member of a pair.

use crate::types::{DatasetResult, PhotoSample};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Square side every image is resized to.
    pub load_size: u32,
    /// Probability of flipping a pair horizontally.
    pub flip_horizontal_prob: f32,
    /// Shuffle pairs at the start of every pass.
    pub shuffle: bool,
    /// Seed for reproducible shuffling and flips.
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            load_size: 256,
            flip_horizontal_prob: 0.5,
            shuffle: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairTransform {
    pub load_size: u32,
    pub flip_horizontal_prob: f32,
}

impl PairTransform {
    pub fn from_config(cfg: &DatasetConfig) -> Self {
        Self {
            load_size: cfg.load_size.max(1),
            flip_horizontal_prob: cfg.flip_horizontal_prob,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "load_size={} flip_p={:.2}",
            self.load_size, self.flip_horizontal_prob
        )
    }

    /// `flip` is drawn once by the caller so that label, image and mask stay aligned.
    pub(crate) fn apply(
        &self,
        label: RgbImage,
        image: RgbImage,
        mask: Option<GrayImage>,
        flip: bool,
    ) -> DatasetResult<PhotoSample> {
        let side = self.load_size;
        let mut label = image::imageops::resize(&label, side, side, FilterType::Triangle);
        let mut image = image::imageops::resize(&image, side, side, FilterType::Triangle);
        let mut mask = mask.map(|m| image::imageops::resize(&m, side, side, FilterType::Nearest));
        if flip {
            image::imageops::flip_horizontal_in_place(&mut label);
            image::imageops::flip_horizontal_in_place(&mut image);
            if let Some(m) = mask.as_mut() {
                image::imageops::flip_horizontal_in_place(m);
            }
        }

        let mask_hw = match mask {
            Some(m) => m
                .pixels()
                .map(|p| if p[0] > 127 { 1.0 } else { 0.0 })
                .collect(),
            None => vec![0.0; (side * side) as usize],
        };

        Ok(PhotoSample {
            label_chw: rgb_to_signed_chw(&label),
            image_chw: rgb_to_signed_chw(&image),
            mask_hw,
            width: side,
            height: side,
        })
    }

    pub(crate) fn draw_flip(&self, rng: &mut dyn rand::RngCore) -> bool {
        self.flip_horizontal_prob > 0.0 && rng.random_range(0.0..1.0) < self.flip_horizontal_prob
    }
}

/// CHW floats in [-1, 1].
pub(crate) fn rgb_to_signed_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * width + x) as usize;
        for c in 0..3 {
            chw[c * plane + base] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    chw
}
