//! Loss log, scalar sink and sample grids.

use anyhow::Context;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct Visualizer {
    log_path: PathBuf,
    scalars_path: PathBuf,
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    step: usize,
    losses: Vec<(&'a str, f32)>,
}

impl Visualizer {
    /// Open `loss_log.txt` and `scalars.jsonl` under `expr_dir`, appending to existing logs.
    pub fn new(expr_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(expr_dir)
            .with_context(|| format!("failed to create {}", expr_dir.display()))?;
        let vis = Self {
            log_path: expr_dir.join("loss_log.txt"),
            scalars_path: expr_dir.join("scalars.jsonl"),
        };
        vis.append(&vis.log_path, "================ Training Loss ================")?;
        Ok(vis)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn scalars_path(&self) -> &Path {
        &self.scalars_path
    }

    fn append(&self, path: &Path, line: &str) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn print_save(&self, message: &str) -> anyhow::Result<()> {
        tracing::info!("{message}");
        self.append(&self.log_path, message)
    }

    /// One line per logging step; zero-valued terms are left out.
    pub fn print_current_errors(
        &self,
        epoch: usize,
        iters: usize,
        errors: &[(String, f32)],
        time_per_sample: f64,
        lr: f64,
    ) -> anyhow::Result<()> {
        self.print_save(&format_errors(epoch, iters, errors, time_per_sample, lr))
    }

    pub fn plot_current_errors(&self, errors: &[(String, f32)], step: usize) -> anyhow::Result<()> {
        let record = ScalarRecord {
            step,
            losses: errors.iter().map(|(k, v)| (k.as_str(), *v)).collect(),
        };
        let line = serde_json::to_string(&record).context("failed to encode scalars")?;
        self.append(&self.scalars_path, &line)
    }
}

pub fn format_errors(
    epoch: usize,
    iters: usize,
    errors: &[(String, f32)],
    time_per_sample: f64,
    lr: f64,
) -> String {
    let mut message =
        format!("(epoch: {epoch}, iters: {iters}, time: {time_per_sample:.3} lr: {lr:.5}) ");
    for (name, value) in errors {
        if *value != 0.0 {
            message.push_str(&format!("{name}: {value:.3} "));
        }
    }
    message
}

/// Write `images` (`[n, 3, h, w]` in [-1, 1]) as one PNG, `nrow` images per row.
///
/// Values are mapped to [0, 1] and then stretched by the grid's own min and max.
pub fn save_sample_grid<B: Backend>(
    path: &Path,
    images: Tensor<B, 4>,
    nrow: usize,
) -> anyhow::Result<()> {
    let [n, c, h, w] = images.dims();
    anyhow::ensure!(n > 0, "no images to save");
    anyhow::ensure!(c == 3, "sample grid expects 3 channels, got {c}");
    let values = images
        .add_scalar(1.0)
        .div_scalar(2.0)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read sample tensor: {e:?}"))?;

    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = (hi - lo).max(1e-5);

    let cols = nrow.clamp(1, n);
    let rows = n.div_ceil(cols);
    let mut grid = RgbImage::new((cols * w) as u32, (rows * h) as u32);
    let plane = h * w;
    for idx in 0..n {
        let (gx, gy) = ((idx % cols) * w, (idx / cols) * h);
        let base = idx * c * plane;
        for y in 0..h {
            for x in 0..w {
                let px = |ch: usize| {
                    let v = (values[base + ch * plane + y * w + x].max(lo).min(hi) - lo) / range;
                    (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8
                };
                grid.put_pixel((gx + x) as u32, (gy + y) as u32, Rgb([px(0), px(1), px(2)]));
            }
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    grid.save(path)
        .with_context(|| format!("failed to save sample grid {}", path.display()))
}

/// Dump a model description to `path`.
pub fn write_text(path: &Path, text: &str) -> anyhow::Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn errors() -> Vec<(String, f32)> {
        vec![
            ("G_GAN".to_string(), 0.5),
            ("G_VGG".to_string(), 0.0),
            ("D_real".to_string(), 0.25),
        ]
    }

    #[test]
    fn error_line_skips_zero_terms() {
        let line = format_errors(3, 40, &errors(), 0.0126, 2e-4);
        assert_eq!(
            line,
            "(epoch: 3, iters: 40, time: 0.013 lr: 0.00020) G_GAN: 0.500 D_real: 0.250 "
        );
    }

    #[test]
    fn log_and_scalars_are_appended() {
        let tmp = tempfile::tempdir().unwrap();
        let vis = Visualizer::new(tmp.path()).unwrap();
        vis.print_current_errors(1, 1, &errors(), 0.1, 1e-3).unwrap();
        vis.plot_current_errors(&errors(), 1).unwrap();
        vis.plot_current_errors(&errors(), 2).unwrap();

        let log = fs::read_to_string(vis.log_path()).unwrap();
        assert_eq!(log.lines().count(), 2);
        let scalars = fs::read_to_string(vis.scalars_path()).unwrap();
        let records: Vec<serde_json::Value> = scalars
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["step"], 2);
        assert_eq!(records[0]["losses"][0][0], "G_GAN");
    }

    #[test]
    fn grid_lays_out_rows_and_stretches_range() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("1_1.png");
        // Six 2x2 images: five on the first row, one on the second.
        let n = 6;
        let values: Vec<f32> = (0..n * 3 * 4)
            .map(|i| if i < 12 { -1.0 } else { 0.0 })
            .collect();
        let images = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(values, [n, 3, 2, 2]),
            &Default::default(),
        );
        save_sample_grid(&path, images, 5).unwrap();

        let grid = image::open(&path).unwrap().to_rgb8();
        assert_eq!(grid.dimensions(), (10, 4));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(2, 0), &Rgb([255, 255, 255]));
    }
}
