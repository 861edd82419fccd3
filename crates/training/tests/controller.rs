use std::{
    cell::{Cell, RefCell},
    path::Path,
    rc::Rc,
};

use candle_core::{DType, Device, Result as CandleResult, Tensor, Var};
use model::{ImageClassifier, Mode, ParameterBlob, ResNet, ResNetConfig};
use tempfile::tempdir;
use training::{
    config::SchedulerConfig, Batch, Checkpoint, CheckpointStore, CheckpointTag, InMemorySource,
    MemorySink, MetricSink, RunContext, SgdConfig, SilentReporter, Trainer, TrainerOptions,
};

const VALIDATION_ROWS: usize = 100;

/// Model whose validation accuracy follows a fixed script, one value per
/// evaluation pass. Training passes go through a single trainable variable.
struct ScriptedModel {
    weight: Var,
    mode: Mode,
    script: Vec<f64>,
    evaluations: Cell<usize>,
    dtype: DType,
    device: Device,
}

impl ScriptedModel {
    fn new(script: &[f64]) -> Self {
        Self::with_dtype(script, DType::F32)
    }

    fn with_dtype(script: &[f64], dtype: DType) -> Self {
        let device = Device::Cpu;
        let weight = Var::from_tensor(&Tensor::zeros((1, 2), dtype, &device).unwrap()).unwrap();
        Self {
            weight,
            mode: Mode::Train,
            script: script.to_vec(),
            evaluations: Cell::new(0),
            dtype,
            device,
        }
    }
}

impl ImageClassifier for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn forward(&self, images: &Tensor) -> CandleResult<Tensor> {
        let batch = images.dims()[0];
        if self.mode.is_train() {
            return self.weight.as_tensor().broadcast_as((batch, 2))?.contiguous();
        }
        let index = self.evaluations.get();
        self.evaluations.set(index + 1);
        let metric = self.script.get(index).copied().unwrap_or(0.0);
        let correct = (metric * batch as f64 / 100.0).round() as usize;
        let scores: Vec<f32> = (0..batch)
            .flat_map(|row| if row < correct { [1.0, 0.0] } else { [0.0, 1.0] })
            .collect();
        Tensor::from_vec(scores, (batch, 2), &self.device)
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        vec![("weight".to_string(), self.weight.clone())]
    }

    fn export_parameters(&self) -> CandleResult<ParameterBlob> {
        let values = self
            .weight
            .as_tensor()
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(ParameterBlob::from_bytes(
            values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ))
    }

    fn import_parameters(&mut self, blob: &ParameterBlob) -> CandleResult<()> {
        let values: Vec<f32> = blob
            .as_bytes()
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        self.weight
            .set(&Tensor::from_vec(values, (1, 2), &self.device)?.to_dtype(self.dtype)?)
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn batch(rows: usize) -> Batch {
    let images = Tensor::zeros((rows, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
    let labels = Tensor::zeros(rows, DType::U32, &Device::Cpu).unwrap();
    Batch::new(images, labels).unwrap()
}

fn sources() -> (InMemorySource, InMemorySource) {
    (
        InMemorySource::new(vec![batch(4), batch(4)]),
        InMemorySource::new(vec![batch(VALIDATION_ROWS)]),
    )
}

fn options(epochs: usize, save_every: usize, checkpoint_dir: &Path) -> TrainerOptions {
    TrainerOptions {
        epochs,
        start_epoch: 0,
        save_every,
        checkpoint_dir: checkpoint_dir.to_path_buf(),
        optimizer: SgdConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
        },
        scheduler: SchedulerConfig::default(),
        warmup: false,
        amp: false,
    }
}

fn trainer(script: &[f64], options: TrainerOptions) -> Trainer {
    Trainer::new(Box::new(ScriptedModel::new(script)), options).unwrap()
}

struct SharedSink(Rc<RefCell<MemorySink>>);

impl MetricSink for SharedSink {
    fn record(&mut self, series: &str, value: f64, step: usize) {
        self.0.borrow_mut().record(series, value, step);
    }
}

#[test]
fn best_checkpoint_written_only_on_strict_improvement() {
    let dir = tempdir().unwrap();
    let mut trainer = trainer(&[70.0, 68.0, 71.0, 71.0, 72.0], options(5, 10, dir.path()));
    let (mut train, mut val) = sources();

    let summary = trainer
        .fit(&mut train, &mut val, &mut RunContext::quiet())
        .unwrap();

    assert_eq!(summary.epochs_run, 5);
    assert_eq!(summary.validation, vec![70.0, 68.0, 71.0, 71.0, 72.0]);
    let best: Vec<(usize, f64)> = summary
        .checkpoints
        .iter()
        .filter(|saved| saved.tag == CheckpointTag::Best)
        .map(|saved| (saved.epoch, saved.best_metric))
        .collect();
    assert_eq!(best, vec![(1, 70.0), (3, 71.0), (5, 72.0)]);
    assert_eq!(summary.best_metric, 72.0);

    let stored = CheckpointStore::new(dir.path())
        .load(CheckpointTag::Best)
        .unwrap()
        .unwrap();
    assert_eq!(stored.epoch, 5);
    assert_eq!(stored.best_metric, 72.0);
    assert_eq!(stored.arch, "scripted");
}

#[test]
fn periodic_checkpoints_every_ten_epochs() {
    let dir = tempdir().unwrap();
    let script = vec![50.0; 25];
    let mut trainer = trainer(&script, options(25, 10, dir.path()));
    let (mut train, mut val) = sources();

    let summary = trainer
        .fit(&mut train, &mut val, &mut RunContext::quiet())
        .unwrap();

    let periodic: Vec<CheckpointTag> = summary
        .checkpoints
        .iter()
        .map(|saved| saved.tag)
        .filter(|tag| matches!(tag, CheckpointTag::Periodic(_)))
        .collect();
    assert_eq!(
        periodic,
        vec![CheckpointTag::Periodic(10), CheckpointTag::Periodic(20)]
    );
    assert!(dir.path().join("checkpoint_10").is_dir());
    assert!(dir.path().join("checkpoint_20").is_dir());
    assert!(!dir.path().join("checkpoint_25").exists());
    assert_eq!(trainer.state().current_epoch, 25);
}

#[test]
fn resume_continues_from_saved_epoch_and_best() {
    let dir = tempdir().unwrap();
    let resume_dir = dir.path().join("resume");
    let checkpoint_dir = dir.path().join("save");
    CheckpointStore::new(&resume_dir)
        .save(
            CheckpointTag::Best,
            &Checkpoint {
                epoch: 5,
                best_metric: 80.0,
                arch: "scripted".into(),
                model_parameters: ParameterBlob::from_bytes(
                    [0.5f32, -0.5].iter().flat_map(|v| v.to_le_bytes()).collect(),
                ),
            },
        )
        .unwrap();

    let mut trainer = trainer(&[75.0, 80.0, 79.0], options(8, 10, &checkpoint_dir));
    assert!(trainer.resume(&resume_dir.join("best_checkpoint")).unwrap());
    assert_eq!(trainer.state().current_epoch, 5);
    assert_eq!(trainer.state().best_metric, 80.0);
    let restored = trainer.model().export_parameters().unwrap();
    assert_eq!(
        restored.as_bytes(),
        [0.5f32, -0.5].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>()
    );

    let (mut train, mut val) = sources();
    let summary = trainer
        .fit(&mut train, &mut val, &mut RunContext::quiet())
        .unwrap();

    assert_eq!(summary.first_epoch, 5);
    assert_eq!(summary.epochs_run, 3);
    assert!(summary.checkpoints.is_empty());
    assert!(!checkpoint_dir.join("best_checkpoint").exists());
    assert_eq!(summary.best_metric, 80.0);
}

#[test]
fn resumed_run_saves_best_once_exceeded() {
    let dir = tempdir().unwrap();
    let resume_path = dir.path().join("checkpoint_5");
    training::save_checkpoint(
        &resume_path,
        &Checkpoint {
            epoch: 5,
            best_metric: 80.0,
            arch: "scripted".into(),
            model_parameters: ParameterBlob::from_bytes(vec![0; 8]),
        },
    )
    .unwrap();

    let mut trainer = trainer(&[79.0, 81.0], options(7, 10, dir.path()));
    trainer.resume(&resume_path).unwrap();
    let (mut train, mut val) = sources();
    let summary = trainer
        .fit(&mut train, &mut val, &mut RunContext::quiet())
        .unwrap();

    assert_eq!(summary.checkpoints.len(), 1);
    assert_eq!(summary.checkpoints[0].tag, CheckpointTag::Best);
    assert_eq!(summary.checkpoints[0].epoch, 7);
    assert_eq!(summary.checkpoints[0].best_metric, 81.0);
}

#[test]
fn missing_resume_path_starts_fresh() {
    let dir = tempdir().unwrap();
    let mut trainer = trainer(&[], options(3, 10, dir.path()));

    assert!(!trainer.resume(&dir.path().join("absent")).unwrap());
    assert_eq!(trainer.state().current_epoch, 0);
    assert_eq!(trainer.state().best_metric, f64::NEG_INFINITY);
}

#[test]
fn resume_rejects_other_architecture() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("best_checkpoint");
    training::save_checkpoint(
        &path,
        &Checkpoint {
            epoch: 2,
            best_metric: 10.0,
            arch: "resnet56".into(),
            model_parameters: ParameterBlob::from_bytes(vec![1]),
        },
    )
    .unwrap();

    let mut trainer = trainer(&[], options(3, 10, dir.path()));
    assert!(trainer.resume(&path).is_err());
    assert_eq!(trainer.state().current_epoch, 0);
}

#[test]
fn evaluate_only_writes_nothing() {
    let dir = tempdir().unwrap();
    let checkpoint_dir = dir.path().join("save");
    let mut trainer = trainer(&[64.0], options(3, 1, &checkpoint_dir));
    let (_, mut val) = sources();

    let metric = trainer.evaluate(&mut val, &mut RunContext::quiet()).unwrap();

    assert_eq!(metric, 64.0);
    assert!(!checkpoint_dir.exists());
    assert_eq!(trainer.state().current_epoch, 0);
    assert_eq!(trainer.model().mode(), Mode::Train);
}

#[test]
fn learning_rate_and_metrics_reach_the_sink() {
    let dir = tempdir().unwrap();
    let mut opts = options(3, 10, dir.path());
    opts.scheduler = SchedulerConfig {
        milestones: vec![2],
        gamma: 0.1,
    };
    let mut trainer = trainer(&[10.0, 20.0, 30.0], opts);
    let (mut train, mut val) = sources();

    let records = Rc::new(RefCell::new(MemorySink::default()));
    let mut ctx = RunContext::new(
        Box::new(SharedSink(Rc::clone(&records))),
        Box::new(SilentReporter),
        1,
    );
    trainer.fit(&mut train, &mut val, &mut ctx).unwrap();

    let records = records.borrow();
    let lrs: Vec<f64> = records
        .series("learning_rate")
        .into_iter()
        .map(|(_, lr)| lr)
        .collect();
    assert_eq!(lrs.len(), 3);
    assert!((lrs[0] - 0.1).abs() < 1e-12);
    assert!((lrs[1] - 0.1).abs() < 1e-12);
    assert!((lrs[2] - 0.01).abs() < 1e-12);
    assert_eq!(
        records.series("accuracy/val"),
        vec![(0, 10.0), (1, 20.0), (2, 30.0)]
    );
    assert_eq!(records.series("loss/train").len(), 3);
}

#[test]
fn warmup_runs_first_epoch_at_a_tenth() {
    let dir = tempdir().unwrap();
    let mut opts = options(2, 10, dir.path());
    opts.warmup = true;
    let mut trainer = trainer(&[1.0, 2.0], opts);
    let (mut train, mut val) = sources();

    let summary = trainer
        .fit(&mut train, &mut val, &mut RunContext::quiet())
        .unwrap();

    assert!((summary.history[0].learning_rate - 0.01).abs() < 1e-12);
    assert!((summary.history[1].learning_rate - 0.1).abs() < 1e-12);
}

fn weights(blob: &ParameterBlob) -> Vec<f32> {
    blob.as_bytes()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[test]
fn resumed_half_precision_weights_survive_training() {
    let dir = tempdir().unwrap();
    let resume_path = dir.path().join("checkpoint_5");
    training::save_checkpoint(
        &resume_path,
        &Checkpoint {
            epoch: 5,
            best_metric: 90.0,
            arch: "scripted".into(),
            model_parameters: ParameterBlob::from_bytes(
                [0.5f32, -0.5].iter().flat_map(|v| v.to_le_bytes()).collect(),
            ),
        },
    )
    .unwrap();

    let mut opts = options(6, 10, &dir.path().join("save"));
    opts.amp = true;
    opts.optimizer = SgdConfig {
        learning_rate: 1e-3,
        momentum: 0.0,
        weight_decay: 0.0,
    };
    let mut trainer = Trainer::new(
        Box::new(ScriptedModel::with_dtype(&[10.0], DType::F16)),
        opts,
    )
    .unwrap();
    assert!(trainer.resume(&resume_path).unwrap());

    let (mut train, mut val) = sources();
    let summary = trainer
        .fit(&mut train, &mut val, &mut RunContext::quiet())
        .unwrap();
    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.history[0].skipped_steps, 0);

    let after = weights(&trainer.model().export_parameters().unwrap());
    assert!((after[0] - 0.5).abs() < 0.01, "{after:?}");
    assert!((after[1] + 0.5).abs() < 0.01, "{after:?}");
}

#[test]
fn half_precision_resnet_trains_with_loss_scaling() {
    let dir = tempdir().unwrap();
    let config = ResNetConfig::with_depth("resnet8", 8, 4, DType::F16, Device::Cpu).unwrap();
    let model = ResNet::new(config).unwrap();
    let before = model.export_parameters().unwrap();

    let mut opts = options(1, 10, dir.path());
    opts.amp = true;
    let mut trainer = Trainer::new(Box::new(model), opts).unwrap();

    let images = Tensor::randn(0f32, 1.0, (4, 3, 8, 8), &Device::Cpu).unwrap();
    let labels = Tensor::new(&[0u32, 1, 2, 3], &Device::Cpu).unwrap();
    let batch = Batch::new(images, labels).unwrap();
    // Early steps may overflow in F16 until the loss scale has backed off.
    let mut train = InMemorySource::new(vec![batch.clone(); 10]);
    let mut val = InMemorySource::new(vec![batch]);

    let summary = trainer
        .fit(&mut train, &mut val, &mut RunContext::quiet())
        .unwrap();

    assert_eq!(summary.epochs_run, 1);
    assert!(summary.history[0].loss.is_finite());
    assert!(summary.history[0].skipped_steps < summary.history[0].batches);
    assert_ne!(trainer.model().export_parameters().unwrap(), before);
    let best = CheckpointStore::new(dir.path())
        .load(CheckpointTag::Best)
        .unwrap()
        .unwrap();
    assert_eq!(best.arch, "resnet8");
}
