use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use candle_core::Device;
use chrono::Local;
use model::{BuildSpec, ImageClassifier};

use crate::{
    checkpoint::{load_checkpoint, Checkpoint, CheckpointStore, CheckpointTag},
    config::{self, to_runtime_error, TrainingConfig},
    context::RunContext,
    data::BatchSource,
    logging::EpochReport,
    loss::CrossEntropyLoss,
    metrics::{EpochStats, RunningMean},
    optimizer::{Sgd, SgdConfig},
    precision::{build_strategy, PrecisionStrategy},
    runner,
    scheduler::{LRScheduler, MultiStepLr},
    TrainingError,
};

/// Progress of a run that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// Next epoch to run.
    pub current_epoch: usize,
    /// Highest validation top-1 so far; `-inf` before the first validation.
    pub best_metric: f64,
}

impl TrainingState {
    pub fn fresh(start_epoch: usize) -> Self {
        Self {
            current_epoch: start_epoch,
            best_metric: f64::NEG_INFINITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub epochs: usize,
    pub start_epoch: usize,
    pub save_every: usize,
    pub checkpoint_dir: PathBuf,
    pub optimizer: SgdConfig,
    pub scheduler: config::SchedulerConfig,
    /// Run epoch 0 at a tenth of the base learning rate.
    pub warmup: bool,
    pub amp: bool,
}

impl TrainerOptions {
    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let arch = config.model.architecture()?;
        Ok(Self {
            epochs: config.runtime.epochs,
            start_epoch: config.runtime.start_epoch,
            save_every: config.runtime.checkpoint.save_every,
            checkpoint_dir: config.runtime.checkpoint.directory.clone(),
            optimizer: SgdConfig::from(&config.optimizer),
            scheduler: config.scheduler.clone(),
            warmup: arch.needs_lr_warmup(),
            amp: config.runtime.amp,
        })
    }
}

/// What a call to [`Trainer::fit`] did.
#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    pub first_epoch: usize,
    pub epochs_run: usize,
    pub best_metric: f64,
    pub history: Vec<EpochStats>,
    pub validation: Vec<f64>,
    pub checkpoints: Vec<SavedCheckpoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedCheckpoint {
    pub tag: CheckpointTag,
    pub path: PathBuf,
    /// Epochs completed when the checkpoint was taken.
    pub epoch: usize,
    pub best_metric: f64,
}

/// Checkpoints due after `epoch` (zero-based) completes.
pub fn checkpoints_due(epoch: usize, is_best: bool, save_every: usize) -> Vec<CheckpointTag> {
    let mut tags = Vec::with_capacity(2);
    if is_best {
        tags.push(CheckpointTag::Best);
    }
    if epoch > 0 && save_every > 0 && (epoch + 1) % save_every == 0 {
        tags.push(CheckpointTag::Periodic(epoch + 1));
    }
    tags
}

/// Drives the epoch loop: train, advance the schedule, validate, keep track
/// of the best accuracy and write checkpoints.
pub struct Trainer {
    model: Box<dyn ImageClassifier>,
    optimizer: Sgd,
    strategy: Box<dyn PrecisionStrategy>,
    criterion: CrossEntropyLoss,
    store: CheckpointStore,
    options: TrainerOptions,
    state: TrainingState,
}

impl Trainer {
    pub fn new(model: Box<dyn ImageClassifier>, options: TrainerOptions) -> Result<Self, TrainingError> {
        if options.save_every == 0 {
            return Err(TrainingError::initialization(
                "checkpoint interval must be greater than zero",
            ));
        }
        let optimizer = Sgd::new(model.trainable_parameters(), options.optimizer)?;
        let strategy = build_strategy(options.amp);
        tracing::info!(
            arch = model.name(),
            parameters = optimizer.parameter_names().count(),
            precision = strategy.name(),
            "trainer initialized"
        );
        Ok(Self {
            model,
            optimizer,
            strategy,
            criterion: CrossEntropyLoss::new(),
            store: CheckpointStore::new(options.checkpoint_dir.clone()),
            state: TrainingState::fresh(options.start_epoch),
            options,
        })
    }

    /// Builds the configured architecture on `device`.
    pub fn from_config(config: &TrainingConfig, device: &Device) -> Result<Self, TrainingError> {
        let arch = config.model.architecture()?;
        let spec = BuildSpec {
            num_classes: config.model.num_classes,
            dtype: config.runtime.parameter_dtype(),
            device: device.clone(),
        };
        let model = arch.build(&spec).map_err(|err| {
            TrainingError::initialization(format!("failed to build {arch}: {err}"))
        })?;
        Self::new(model, TrainerOptions::from_config(config)?)
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn model(&self) -> &dyn ImageClassifier {
        self.model.as_ref()
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Restores weights, epoch and best accuracy from the checkpoint at
    /// `path`. Returns `false`, leaving the trainer untouched, when there is
    /// no checkpoint there.
    pub fn resume(&mut self, path: &Path) -> Result<bool, TrainingError> {
        let Some(checkpoint) = load_checkpoint(path)? else {
            tracing::warn!("no checkpoint found at '{}', starting fresh", path.display());
            return Ok(false);
        };
        if checkpoint.arch != self.model.name() {
            return Err(TrainingError::checkpoint(format!(
                "checkpoint at '{}' holds {} weights but the model is {}",
                path.display(),
                checkpoint.arch,
                self.model.name()
            )));
        }
        self.model
            .import_parameters(&checkpoint.model_parameters)
            .map_err(to_runtime_error)?;
        self.optimizer.reload_parameters()?;
        self.state = TrainingState {
            current_epoch: checkpoint.epoch,
            best_metric: checkpoint.best_metric,
        };
        tracing::info!(
            "loaded checkpoint '{}' (epoch {}, best prec@1 {:.3})",
            path.display(),
            checkpoint.epoch,
            checkpoint.best_metric
        );
        Ok(true)
    }

    /// Single validation pass without touching training state.
    pub fn evaluate(&mut self, validation: &mut dyn BatchSource, ctx: &mut RunContext) -> Result<f64, TrainingError> {
        let outcome = runner::validate(self.model.as_mut(), validation, &self.criterion, None, ctx)?;
        ctx.sink.flush();
        Ok(outcome.top1)
    }

    pub fn fit(
        &mut self,
        train: &mut dyn BatchSource,
        validation: &mut dyn BatchSource,
        ctx: &mut RunContext,
    ) -> Result<TrainingSummary, TrainingError> {
        let first_epoch = self.state.current_epoch;
        let mut scheduler = MultiStepLr::from_training_config(
            &self.options.scheduler,
            self.options.optimizer.learning_rate,
            first_epoch,
        )?
        .with_warmup(self.options.warmup);

        let mut summary = TrainingSummary {
            first_epoch,
            best_metric: self.state.best_metric,
            ..TrainingSummary::default()
        };
        let mut train_time = RunningMean::new();
        let mut val_time = RunningMean::new();

        tracing::info!(
            "training {} for epochs {}..{} (started {})",
            self.model.name(),
            first_epoch,
            self.options.epochs,
            timestamp()
        );

        for epoch in first_epoch..self.options.epochs {
            let epoch_started = Instant::now();

            let lr = scheduler.learning_rate();
            self.optimizer.set_learning_rate(lr);
            ctx.sink.record("learning_rate", lr, epoch);
            tracing::info!(epoch, "current lr {:.5e}", lr);

            let stats = runner::train_epoch(
                self.model.as_mut(),
                train,
                self.strategy.as_mut(),
                &mut self.optimizer,
                &self.criterion,
                epoch,
                ctx,
            )?;
            train_time.update_duration(stats.elapsed);
            if stats.skipped_steps > 0 {
                tracing::info!(
                    epoch,
                    "skipped {} of {} steps on non-finite gradients",
                    stats.skipped_steps,
                    stats.batches
                );
            }
            scheduler.step();

            let val_started = Instant::now();
            let outcome =
                runner::validate(self.model.as_mut(), validation, &self.criterion, Some(epoch), ctx)?;
            let val_elapsed = val_started.elapsed();
            val_time.update_duration(val_elapsed);

            let metric = outcome.top1;
            let is_best = metric > self.state.best_metric;
            if is_best {
                self.state.best_metric = metric;
            }
            self.state.current_epoch = epoch + 1;

            for tag in checkpoints_due(epoch, is_best, self.options.save_every) {
                let path = self.save(tag)?;
                summary.checkpoints.push(SavedCheckpoint {
                    tag,
                    path,
                    epoch: self.state.current_epoch,
                    best_metric: self.state.best_metric,
                });
            }

            ctx.reporter.epoch(&EpochReport {
                epoch,
                train_loss: stats.loss,
                train_top1: stats.top1,
                val_top1: metric,
                best_top1: self.state.best_metric,
                learning_rate: lr,
                train_time: stats.elapsed,
                train_time_avg: train_time.mean(),
                val_time: val_elapsed,
                val_time_avg: val_time.mean(),
                epoch_time: epoch_started.elapsed(),
                finished_at: timestamp(),
            });
            ctx.sink.flush();

            summary.epochs_run += 1;
            summary.history.push(stats);
            summary.validation.push(metric);
        }

        summary.best_metric = self.state.best_metric;
        tracing::info!(
            "finished at {}; best prec@1 {:.3}",
            timestamp(),
            summary.best_metric
        );
        Ok(summary)
    }

    fn save(&self, tag: CheckpointTag) -> Result<PathBuf, TrainingError> {
        let checkpoint = Checkpoint {
            epoch: self.state.current_epoch,
            best_metric: self.state.best_metric,
            arch: self.model.name().to_string(),
            model_parameters: self.model.export_parameters().map_err(to_runtime_error)?,
        };
        let path = self.store.save(tag, &checkpoint)?;
        tracing::debug!("saved checkpoint {}", path.display());
        Ok(path)
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
