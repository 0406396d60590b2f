use burn::backend::{ndarray::NdArray, Autodiff};
use burn::tensor::{Tensor, TensorData};
use models::{ForwardOutput, LossValue, MappingModel, ModelError, LOSS_NAMES};
use photo_dataset::{BatchSource, DatasetResult, MappingBatch};
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use training::{ProgressState, TrainOptions, Trainer};

type B = Autodiff<NdArray<f32>>;

/// Returns fixed losses and records every side effect it is asked for.
#[derive(Default)]
struct RecordingModel {
    skip_calls: Vec<usize>,
    drop_last_loss: bool,
    calls: usize,
    mapping_steps: usize,
    d_steps: usize,
    lr: f64,
    events: RefCell<Vec<String>>,
}

impl RecordingModel {
    fn new() -> Self {
        Self {
            lr: 1.0,
            ..Default::default()
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

fn scalar(v: f32) -> LossValue<B> {
    LossValue::Tensor(Tensor::from_data(
        TensorData::new(vec![v], [1]),
        &Default::default(),
    ))
}

impl MappingModel<B> for RecordingModel {
    fn loss_names(&self) -> Vec<String> {
        LOSS_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn forward(
        &mut self,
        batch: &MappingBatch<B>,
        infer: bool,
    ) -> Result<ForwardOutput<B>, ModelError> {
        let call = self.calls;
        self.calls += 1;
        if self.skip_calls.contains(&call) {
            return Ok(ForwardOutput {
                losses: None,
                generated: None,
            });
        }
        let mut losses = vec![
            scalar(1.0),
            scalar(0.5),
            scalar(0.25),
            LossValue::Constant(0.0),
            scalar(0.2),
            scalar(0.4),
            LossValue::Constant(0.0),
        ];
        if self.drop_last_loss {
            losses.pop();
        }
        Ok(ForwardOutput {
            losses: Some(losses),
            generated: infer.then(|| batch.image.clone()),
        })
    }

    fn optimize_mapping(&mut self, loss_g: LossValue<B>) {
        assert!((loss_g.value() - 1.75).abs() < 1e-6);
        self.mapping_steps += 1;
    }

    fn optimize_discriminator(&mut self, loss_d: LossValue<B>) {
        assert!((loss_d.value() - 0.3).abs() < 1e-6);
        assert_eq!(self.mapping_steps, self.d_steps + 1, "generator step comes first");
        self.d_steps += 1;
    }

    fn old_lr(&self) -> f64 {
        self.lr
    }

    fn save(&self, tag: &str) -> Result<(), ModelError> {
        self.events.borrow_mut().push(tag.to_string());
        Ok(())
    }

    fn update_fixed_params(&mut self) {
        self.events.borrow_mut().push("unfreeze".into());
    }

    fn update_learning_rate(&mut self) {
        self.lr -= 0.25;
        self.events.borrow_mut().push("decay".into());
    }

    fn describe(&self, _use_skip_model: bool) -> String {
        "RecordingModel\n".into()
    }
}

struct SyntheticSource {
    batches: usize,
    batch_size: usize,
    cursor: usize,
    served: usize,
}

impl SyntheticSource {
    fn new(batches: usize, batch_size: usize) -> Self {
        Self {
            batches,
            batch_size,
            cursor: 0,
            served: 0,
        }
    }
}

impl BatchSource<B> for SyntheticSource {
    fn num_batches(&self) -> usize {
        self.batches
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn start_epoch(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(
        &mut self,
        device: &<B as burn::tensor::backend::Backend>::Device,
    ) -> DatasetResult<Option<MappingBatch<B>>> {
        if self.cursor >= self.batches {
            return Ok(None);
        }
        self.cursor += 1;
        self.served += 1;
        let n = self.batch_size;
        Ok(Some(MappingBatch {
            label: Tensor::zeros([n, 3, 4, 4], device).sub_scalar(1.0),
            inst: Tensor::zeros([n, 1, 4, 4], device),
            image: Tensor::ones([n, 3, 4, 4], device),
            feat: None,
        }))
    }
}

fn base_opts(root: &Path) -> TrainOptions {
    TrainOptions {
        name: "run".into(),
        checkpoints_dir: root.join("checkpoints"),
        outputs_dir: root.join("outputs"),
        gpu_ids: "-1".into(),
        display_freq: 1000,
        print_freq: 1000,
        save_latest_freq: 1000,
        save_epoch_freq: 1,
        niter: 1,
        niter_decay: 0,
        ..TrainOptions::default()
    }
}

fn trainer(
    opts: TrainOptions,
    model: RecordingModel,
    source: SyntheticSource,
) -> Trainer<B, RecordingModel, SyntheticSource> {
    Trainer::new(opts, model, source, Default::default()).unwrap()
}

fn error_lines(opts: &TrainOptions) -> Vec<String> {
    fs::read_to_string(opts.expr_dir().join("loss_log.txt"))
        .unwrap()
        .lines()
        .filter(|l| l.starts_with("(epoch:"))
        .map(str::to_string)
        .collect()
}

fn logged_steps(opts: &TrainOptions) -> Vec<u64> {
    let path = opts.expr_dir().join("scalars.jsonl");
    if !path.exists() {
        return Vec::new();
    }
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["step"].as_u64().unwrap()
        })
        .collect()
}

fn sample_files(opts: &TrainOptions) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(opts.sample_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn single_batch_epoch_logs_samples_and_checkpoints_once() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        display_freq: 1,
        print_freq: 1,
        save_epoch_freq: 1,
        ..base_opts(tmp.path())
    };
    let mut t = trainer(opts.clone(), RecordingModel::new(), SyntheticSource::new(1, 1));
    let summary = t.run().unwrap();

    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.total_steps, 1);
    assert_eq!(summary.log_lines, 1);
    assert_eq!(summary.samples_written, 1);
    assert_eq!(summary.checkpoints_written, 2);

    let lines = error_lines(&opts);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("(epoch: 1, iters: 1, time: "), "{}", lines[0]);
    assert!(lines[0].contains("G_GAN: 0.500"));
    assert!(!lines[0].contains("G_VGG"));

    assert_eq!(sample_files(&opts), vec!["1_1.png".to_string()]);
    assert_eq!(t.model().events(), vec!["latest".to_string(), "1".to_string()]);
    assert_eq!(
        ProgressState::load(&opts.iter_path()).unwrap(),
        ProgressState::new(2, 0)
    );
    assert!(opts.expr_dir().join("opt.txt").exists());
    assert_eq!(
        fs::read_to_string(opts.expr_dir().join("model.txt")).unwrap(),
        "RecordingModel\n"
    );
    let log = fs::read_to_string(opts.expr_dir().join("loss_log.txt")).unwrap();
    assert!(log.contains("#training images = 1"));
    assert!(log.contains("End of epoch 1 / 1"));
}

#[test]
fn skipped_iterations_never_step_or_log() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        display_freq: 1,
        print_freq: 1,
        ..base_opts(tmp.path())
    };
    let model = RecordingModel {
        skip_calls: vec![0, 1],
        ..RecordingModel::new()
    };
    let mut t = trainer(opts.clone(), model, SyntheticSource::new(2, 1));
    let summary = t.run().unwrap();

    assert_eq!(summary.skipped_iterations, 2);
    assert_eq!(summary.optimized_iterations, 0);
    assert_eq!(summary.total_steps, 2);
    assert_eq!(t.model().mapping_steps, 0);
    assert_eq!(t.model().d_steps, 0);
    assert!(error_lines(&opts).is_empty());
    assert!(logged_steps(&opts).is_empty());
    assert!(sample_files(&opts).is_empty());
}

#[test]
fn a_skip_only_affects_its_own_iteration() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        print_freq: 1,
        ..base_opts(tmp.path())
    };
    let model = RecordingModel {
        skip_calls: vec![1],
        ..RecordingModel::new()
    };
    let mut t = trainer(opts.clone(), model, SyntheticSource::new(3, 1));
    let summary = t.run().unwrap();

    assert_eq!(summary.skipped_iterations, 1);
    assert_eq!(t.model().mapping_steps, 2);
    assert_eq!(t.model().d_steps, 2);
    assert_eq!(logged_steps(&opts), vec![1, 3]);
}

#[test]
fn a_skip_on_the_boundary_batch_does_not_end_the_epoch() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        continue_train: true,
        ..base_opts(tmp.path())
    };
    ProgressState::new(1, 2).save(&opts.iter_path()).unwrap();
    let model = RecordingModel {
        skip_calls: vec![0],
        ..RecordingModel::new()
    };
    let mut t = trainer(opts, model, SyntheticSource::new(3, 1));
    let summary = t.run().unwrap();

    // The skipped batch reaches the dataset size; the next one is still trained on.
    assert_eq!(t.source().served, 2);
    assert_eq!(summary.skipped_iterations, 1);
    assert_eq!(summary.optimized_iterations, 1);
    assert_eq!(summary.total_steps, 4);
    assert_eq!(t.model().mapping_steps, 1);
}

#[test]
fn resumed_run_keeps_the_periodic_phase() {
    let cadence = |root: &Path| TrainOptions {
        print_freq: 2,
        save_latest_freq: 2,
        niter: 2,
        ..base_opts(root)
    };

    let uninterrupted = tempfile::tempdir().unwrap();
    let opts_a = cadence(uninterrupted.path());
    let mut a = trainer(opts_a.clone(), RecordingModel::new(), SyntheticSource::new(3, 1));
    let summary_a = a.run().unwrap();
    assert_eq!(summary_a.total_steps, 6);
    assert_eq!(logged_steps(&opts_a), vec![1, 2, 4, 6]);

    // Resume where the uninterrupted run saved `latest` at step 4.
    let resumed = tempfile::tempdir().unwrap();
    let opts_b = TrainOptions {
        continue_train: true,
        ..cadence(resumed.path())
    };
    ProgressState::new(2, 1).save(&opts_b.iter_path()).unwrap();
    let mut b = trainer(opts_b.clone(), RecordingModel::new(), SyntheticSource::new(3, 1));
    let summary_b = b.run().unwrap();

    assert_eq!(summary_b.epochs_run, 1);
    assert_eq!(summary_b.total_steps, 6);
    let expected: Vec<u64> = logged_steps(&opts_a).into_iter().filter(|s| *s > 4).collect();
    assert_eq!(logged_steps(&opts_b), expected);
    // The resumed epoch stops at the dataset size without draining the pass.
    assert_eq!(b.source().served, 2);
}

#[test]
fn mid_epoch_latest_save_records_position() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        save_latest_freq: 2,
        save_epoch_freq: 5,
        niter: 1,
        ..base_opts(tmp.path())
    };
    let mut t = trainer(opts.clone(), RecordingModel::new(), SyntheticSource::new(3, 1));
    let summary = t.run().unwrap();

    assert_eq!(summary.checkpoints_written, 1);
    assert_eq!(t.model().events(), vec!["latest".to_string()]);
    assert_eq!(
        ProgressState::load(&opts.iter_path()).unwrap(),
        ProgressState::new(1, 2)
    );
}

#[test]
fn which_epoch_selects_the_start_epoch() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        continue_train: true,
        which_epoch: "3".into(),
        niter: 3,
        ..base_opts(tmp.path())
    };
    ProgressState::new(5, 0).save(&opts.iter_path()).unwrap();
    let mut t = trainer(opts.clone(), RecordingModel::new(), SyntheticSource::new(1, 1));
    let summary = t.run().unwrap();

    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.total_steps, 3);
    assert_eq!(t.model().events(), vec!["latest".to_string(), "3".to_string()]);
    assert_eq!(
        ProgressState::load(&opts.iter_path()).unwrap(),
        ProgressState::new(4, 0)
    );
    let log = fs::read_to_string(opts.expr_dir().join("loss_log.txt")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert!(lines.contains(&"Resuming from epoch 4 at iteration 0"), "{log}");
    assert!(lines.contains(&"Notice : Resuming from epoch 2 at iteration 0"), "{log}");
}

#[test]
fn which_epoch_applies_without_continue_train() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        which_epoch: "2".into(),
        niter: 2,
        ..base_opts(tmp.path())
    };
    ProgressState::new(5, 7).save(&opts.iter_path()).unwrap();
    let mut t = trainer(opts.clone(), RecordingModel::new(), SyntheticSource::new(1, 1));
    let summary = t.run().unwrap();

    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.total_steps, 2);
    assert_eq!(t.model().events(), vec!["latest".to_string(), "2".to_string()]);
    let log = fs::read_to_string(opts.expr_dir().join("loss_log.txt")).unwrap();
    assert!(!log.lines().any(|l| l.starts_with("Resuming from")), "{log}");
    assert!(log.lines().any(|l| l == "Notice : Resuming from epoch 1 at iteration 0"), "{log}");
}

#[test]
fn unfreeze_and_decay_follow_the_epoch_schedule() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        niter: 2,
        niter_decay: 2,
        niter_fix_global: 1,
        ..base_opts(tmp.path())
    };
    let mut t = trainer(opts, RecordingModel::new(), SyntheticSource::new(1, 1));
    let summary = t.run().unwrap();

    assert_eq!(summary.epochs_run, 4);
    assert_eq!(
        t.model().events(),
        [
            "latest", "1", "unfreeze", "latest", "2", "latest", "3", "decay", "latest", "4",
            "decay"
        ]
        .map(String::from)
        .to_vec()
    );
    assert!((summary.final_lr - 0.5).abs() < 1e-12);
}

#[test]
fn sample_grid_includes_the_mask_when_requested() {
    for (with_mask, rows) in [(true, 4u32), (false, 3u32)] {
        let tmp = tempfile::tempdir().unwrap();
        let opts = TrainOptions {
            display_freq: 1,
            nl_use_mask: with_mask,
            batch_size: 5,
            ..base_opts(tmp.path())
        };
        let mut t = trainer(opts.clone(), RecordingModel::new(), SyntheticSource::new(1, 5));
        t.run().unwrap();

        let files = sample_files(&opts);
        assert_eq!(files, vec!["1_5.png".to_string()]);
        let grid = image::open(opts.sample_dir().join(&files[0]))
            .unwrap()
            .to_rgb8();
        assert_eq!(grid.dimensions(), (5 * 4, rows * 4));
    }
}

#[test]
fn loss_list_length_mismatch_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let model = RecordingModel {
        drop_last_loss: true,
        ..RecordingModel::new()
    };
    let mut t = trainer(base_opts(tmp.path()), model, SyntheticSource::new(1, 1));
    let err = t.run().unwrap_err().to_string();
    assert!(err.contains("7 loss names"), "{err}");
}

#[test]
fn zero_print_frequency_is_rejected_up_front() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = TrainOptions {
        print_freq: 0,
        ..base_opts(tmp.path())
    };
    let result = Trainer::<B, _, _>::new(
        opts,
        RecordingModel::new(),
        SyntheticSource::new(1, 1),
        Default::default(),
    );
    assert!(result.is_err());
}
