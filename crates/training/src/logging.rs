//! Metric sinks and console progress reporting.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{metrics::RunningMean, TrainingError};

/// Destination for scalar time series such as `train/loss` per epoch.
///
/// Recording is fire-and-forget: sinks report their own failures.
pub trait MetricSink {
    fn record(&mut self, series: &str, value: f64, step: usize);

    fn flush(&mut self) {}
}

/// Discards every record.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn record(&mut self, _series: &str, _value: f64, _step: usize) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub series: String,
    pub value: f64,
    pub step: usize,
}

/// Keeps records in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<MetricRecord>,
}

impl MemorySink {
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|record| record.series == name)
            .map(|record| (record.step, record.value))
            .collect()
    }
}

impl MetricSink for MemorySink {
    fn record(&mut self, series: &str, value: f64, step: usize) {
        self.records.push(MetricRecord {
            series: series.to_string(),
            value,
            step,
        });
    }
}

/// Writes scalars to a TensorBoard event file in `directory`.
pub struct TensorBoardSink {
    writer: TensorBoardWriter,
    failed: bool,
}

impl TensorBoardSink {
    pub fn create(directory: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        Ok(Self {
            writer: TensorBoardWriter::create(directory, flush_every)?,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    fn report(&mut self, err: TrainingError) {
        if !self.failed {
            tracing::warn!("tensorboard logging disabled after error: {err}");
            self.failed = true;
        }
    }
}

impl MetricSink for TensorBoardSink {
    fn record(&mut self, series: &str, value: f64, step: usize) {
        if self.failed {
            return;
        }
        if let Err(err) = self.writer.write_scalar(series, step as i64, value) {
            self.report(err);
        }
    }

    fn flush(&mut self) {
        if self.failed {
            return;
        }
        if let Err(err) = self.writer.flush() {
            self.report(err);
        }
    }
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Validate,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validate => "val",
        }
    }
}

/// Snapshot of a pass in progress, emitted every `print_freq` batches.
#[derive(Debug)]
pub struct BatchProgress<'a> {
    pub phase: Phase,
    pub epoch: Option<usize>,
    pub batch: usize,
    pub batches: usize,
    pub batch_time: &'a RunningMean,
    pub data_time: &'a RunningMean,
    pub loss: &'a RunningMean,
    pub top1: &'a RunningMean,
}

/// Timings and results of one completed epoch of the controller loop.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_top1: f64,
    pub val_top1: f64,
    pub best_top1: f64,
    pub learning_rate: f64,
    pub train_time: Duration,
    pub train_time_avg: f64,
    pub val_time: Duration,
    pub val_time_avg: f64,
    pub epoch_time: Duration,
    pub finished_at: String,
}

/// Console-facing progress collaborator.
pub trait ProgressReporter {
    fn batch(&mut self, progress: &BatchProgress<'_>);

    fn validation(&mut self, loss: f64, top1: f64);

    fn epoch(&mut self, report: &EpochReport);
}

/// Reports through `tracing` at `info` level.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn batch(&mut self, p: &BatchProgress<'_>) {
        let epoch = p.epoch.map_or_else(|| "-".to_string(), |epoch| epoch.to_string());
        tracing::info!(
            "{} epoch={} [{}/{}] time {:.3} ({:.3}) data {:.3} ({:.3}) loss {:.4} ({:.4}) prec@1 {:.3} ({:.3})",
            p.phase.label(),
            epoch,
            p.batch,
            p.batches,
            p.batch_time.last(),
            p.batch_time.mean(),
            p.data_time.last(),
            p.data_time.mean(),
            p.loss.last(),
            p.loss.mean(),
            p.top1.last(),
            p.top1.mean(),
        );
    }

    fn validation(&mut self, loss: f64, top1: f64) {
        tracing::info!(" * prec@1 {:.3} loss {:.4}", top1, loss);
    }

    fn epoch(&mut self, r: &EpochReport) {
        tracing::info!(
            epoch = r.epoch,
            lr = r.learning_rate,
            "epoch done: train loss {:.4} prec@1 {:.3} | val prec@1 {:.3} (best {:.3})",
            r.train_loss,
            r.train_top1,
            r.val_top1,
            r.best_top1,
        );
        tracing::info!(
            epoch = r.epoch,
            "train time {:.1}s (avg {:.1}s) | validation time {:.1}s (avg {:.1}s) | epoch {:.1}s | at {}",
            r.train_time.as_secs_f64(),
            r.train_time_avg,
            r.val_time.as_secs_f64(),
            r.val_time_avg,
            r.epoch_time.as_secs_f64(),
            r.finished_at,
        );
    }
}

/// Reporter that drops everything.
#[derive(Debug, Default)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn batch(&mut self, _progress: &BatchProgress<'_>) {}

    fn validation(&mut self, _loss: f64, _top1: f64) {}

    fn epoch(&mut self, _report: &EpochReport) {}
}
