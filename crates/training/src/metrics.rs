use std::time::Duration;

use candle_core::{DType, Tensor};

use crate::{config::to_runtime_error, TrainingError};

/// Weighted running mean of a scalar series. Tracks the latest sample as
/// well, which is what per-batch progress lines print next to the average.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    last: f64,
    sum: f64,
    count: f64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds `value` observed `weight` times (usually the batch size).
    pub fn update(&mut self, value: f64, weight: usize) {
        self.last = value;
        self.sum += value * weight as f64;
        self.count += weight as f64;
    }

    pub fn update_duration(&mut self, elapsed: Duration) {
        self.update(elapsed.as_secs_f64(), 1);
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    /// Zero until the first update.
    pub fn mean(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }
}

/// Percentage of rows whose target class is among the `k` highest scores,
/// one entry per requested `k`.
///
/// Ranking is stable: equal scores rank the lower class index first.
pub fn accuracy(scores: &Tensor, targets: &Tensor, topk: &[usize]) -> Result<Vec<f64>, TrainingError> {
    let (batch, classes) = scores.dims2().map_err(to_runtime_error)?;
    if batch == 0 {
        return Err(TrainingError::runtime("accuracy requires a non-empty batch"));
    }
    if targets.dims() != [batch] {
        return Err(TrainingError::runtime(format!(
            "accuracy targets must have shape [{batch}] (got {:?})",
            targets.dims()
        )));
    }
    if let Some(&k) = topk.iter().find(|&&k| k == 0 || k > classes) {
        return Err(TrainingError::runtime(format!(
            "top-{k} accuracy is undefined for {classes} classes"
        )));
    }

    let rows = scores
        .to_dtype(DType::F32)
        .and_then(|scores| scores.to_vec2::<f32>())
        .map_err(to_runtime_error)?;
    let labels = targets
        .to_dtype(DType::U32)
        .and_then(|targets| targets.to_vec1::<u32>())
        .map_err(to_runtime_error)?;

    let mut correct = vec![0usize; topk.len()];
    for (row, &label) in rows.iter().zip(labels.iter()) {
        let label = label as usize;
        if label >= classes {
            return Err(TrainingError::runtime(format!(
                "target class {label} out of range for {classes} classes"
            )));
        }
        let rank = target_rank(row, label);
        for (hits, &k) in correct.iter_mut().zip(topk) {
            if rank < k {
                *hits += 1;
            }
        }
    }

    Ok(correct
        .into_iter()
        .map(|hits| hits as f64 * 100.0 / batch as f64)
        .collect())
}

fn target_rank(row: &[f32], label: usize) -> usize {
    let target = row[label];
    row.iter()
        .enumerate()
        .filter(|&(class, &score)| score > target || (score == target && class < label))
        .count()
}

/// Aggregates of one completed training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub top1: f64,
    pub learning_rate: f64,
    pub batches: usize,
    pub skipped_steps: usize,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scores(values: &[[f32; 3]]) -> Tensor {
        Tensor::from_vec(values.concat(), (values.len(), 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn running_mean_is_weighted() {
        let mut meter = RunningMean::new();
        assert_eq!(meter.mean(), 0.0);

        meter.update(1.0, 2);
        meter.update(4.0, 1);
        assert_eq!(meter.last(), 4.0);
        assert_eq!(meter.sum(), 6.0);
        assert_eq!(meter.count(), 3.0);
        assert_eq!(meter.mean(), 2.0);

        meter.reset();
        assert_eq!(meter.count(), 0.0);
        assert_eq!(meter.mean(), 0.0);
    }

    #[test]
    fn top1_counts_argmax_matches() {
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2]], &Device::Cpu).unwrap();
        let hit = Tensor::new(&[1u32, 0], &Device::Cpu).unwrap();
        let miss = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();

        assert_eq!(accuracy(&logits, &hit, &[1]).unwrap(), vec![100.0]);
        assert_eq!(accuracy(&logits, &miss, &[1]).unwrap(), vec![0.0]);
    }

    #[test]
    fn topk_reports_each_k() {
        let logits = scores(&[[0.5, 0.3, 0.2], [0.1, 0.2, 0.7]]);
        let targets = Tensor::new(&[1u32, 0], &Device::Cpu).unwrap();
        assert_eq!(
            accuracy(&logits, &targets, &[1, 2, 3]).unwrap(),
            vec![0.0, 50.0, 100.0]
        );
    }

    #[test]
    fn ties_prefer_lower_class_index() {
        let logits = scores(&[[0.5, 0.5, 0.0], [0.5, 0.5, 0.0]]);
        let targets = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
        assert_eq!(accuracy(&logits, &targets, &[1]).unwrap(), vec![50.0]);
    }

    #[test]
    fn rejects_degenerate_requests() {
        let logits = scores(&[[0.5, 0.3, 0.2]]);
        let targets = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        assert!(accuracy(&logits, &targets, &[4]).is_err());

        let empty = Tensor::zeros((0, 3), DType::F32, &Device::Cpu).unwrap();
        let no_targets = Tensor::zeros(0, DType::U32, &Device::Cpu).unwrap();
        assert!(accuracy(&empty, &no_targets, &[1]).is_err());
    }
}
