//! One pass over a batch source, in training or evaluation mode.

use std::time::Instant;

use model::{ImageClassifier, Mode};

use crate::{
    config::to_runtime_error,
    context::RunContext,
    data::BatchSource,
    logging::{BatchProgress, Phase},
    loss::CrossEntropyLoss,
    metrics::{accuracy, EpochStats, RunningMean},
    optimizer::Sgd,
    precision::PrecisionStrategy,
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationOutcome {
    pub loss: f64,
    pub top1: f64,
    pub batches: usize,
}

/// Meters shared by both passes.
#[derive(Default)]
struct PassMeters {
    batch_time: RunningMean,
    data_time: RunningMean,
    loss: RunningMean,
    top1: RunningMean,
}

impl PassMeters {
    fn progress(&self, phase: Phase, epoch: Option<usize>, batch: usize, batches: usize) -> BatchProgress<'_> {
        BatchProgress {
            phase,
            epoch,
            batch,
            batches,
            batch_time: &self.batch_time,
            data_time: &self.data_time,
            loss: &self.loss,
            top1: &self.top1,
        }
    }
}

/// Trains `model` on every batch of `source` once.
#[allow(clippy::too_many_arguments)]
pub fn train_epoch(
    model: &mut dyn ImageClassifier,
    source: &mut dyn BatchSource,
    strategy: &mut dyn PrecisionStrategy,
    optimizer: &mut Sgd,
    criterion: &CrossEntropyLoss,
    epoch: usize,
    ctx: &mut RunContext,
) -> Result<EpochStats, TrainingError> {
    model.set_mode(Mode::Train);
    let started = Instant::now();
    let num_batches = source.num_batches();
    let mut meters = PassMeters::default();
    let mut processed = 0usize;
    let mut skipped = 0usize;

    let mut tick = Instant::now();
    for batch in source.batches(epoch)? {
        let batch = batch?;
        meters.data_time.update_duration(tick.elapsed());

        let output = strategy.execute_step(&*model, optimizer, criterion, &batch)?;
        if !output.applied {
            skipped += 1;
        }
        let top1 = accuracy(&output.logits, &batch.labels, &[1])?[0];
        let size = batch.len();
        meters.loss.update(output.loss, size);
        meters.top1.update(top1, size);

        meters.batch_time.update_duration(tick.elapsed());
        tick = Instant::now();

        if ctx.should_report(processed) {
            ctx.reporter
                .batch(&meters.progress(Phase::Train, Some(epoch), processed, num_batches));
        }
        processed += 1;
    }

    if processed == 0 {
        return Err(TrainingError::runtime(format!(
            "training source yielded no batches in epoch {epoch}"
        )));
    }

    ctx.sink.record("loss/train", meters.loss.mean(), epoch);
    ctx.sink.record("accuracy/train", meters.top1.mean(), epoch);

    Ok(EpochStats {
        epoch,
        loss: meters.loss.mean(),
        top1: meters.top1.mean(),
        learning_rate: optimizer.learning_rate(),
        batches: processed,
        skipped_steps: skipped,
        elapsed: started.elapsed(),
    })
}

/// Evaluates `model` on every batch of `source` and returns the mean top-1
/// accuracy.
///
/// The model runs in evaluation mode for the duration of the call and gets
/// its previous mode back on every exit path. Metric series are recorded only
/// when `epoch` is known.
pub fn validate(
    model: &mut dyn ImageClassifier,
    source: &mut dyn BatchSource,
    criterion: &CrossEntropyLoss,
    epoch: Option<usize>,
    ctx: &mut RunContext,
) -> Result<ValidationOutcome, TrainingError> {
    let previous = model.mode();
    model.set_mode(Mode::Eval);
    let result = validate_in_eval_mode(&*model, source, criterion, epoch, ctx);
    model.set_mode(previous);
    result
}

fn validate_in_eval_mode(
    model: &dyn ImageClassifier,
    source: &mut dyn BatchSource,
    criterion: &CrossEntropyLoss,
    epoch: Option<usize>,
    ctx: &mut RunContext,
) -> Result<ValidationOutcome, TrainingError> {
    let num_batches = source.num_batches();
    let mut meters = PassMeters::default();
    let mut processed = 0usize;

    let mut tick = Instant::now();
    for batch in source.batches(epoch.unwrap_or(0))? {
        let batch = batch?;
        meters.data_time.update_duration(tick.elapsed());

        let images = batch
            .images
            .to_device(model.device())
            .and_then(|images| images.to_dtype(model.dtype()))
            .map_err(to_runtime_error)?;
        let logits = model.forward(&images).map_err(to_runtime_error)?.detach();
        let loss = criterion.compute(&logits, &batch.labels)?;
        let top1 = accuracy(&logits, &batch.labels, &[1])?[0];
        let size = batch.len();
        meters.loss.update(loss.value, size);
        meters.top1.update(top1, size);

        meters.batch_time.update_duration(tick.elapsed());
        tick = Instant::now();

        if ctx.should_report(processed) {
            ctx.reporter
                .batch(&meters.progress(Phase::Validate, epoch, processed, num_batches));
        }
        processed += 1;
    }

    if processed == 0 {
        return Err(TrainingError::runtime("validation source yielded no batches"));
    }

    ctx.reporter.validation(meters.loss.mean(), meters.top1.mean());
    if let Some(epoch) = epoch {
        ctx.sink.record("loss/val", meters.loss.mean(), epoch);
        ctx.sink.record("accuracy/val", meters.top1.mean(), epoch);
    }

    Ok(ValidationOutcome {
        loss: meters.loss.mean(),
        top1: meters.top1.mean(),
        batches: processed,
    })
}
