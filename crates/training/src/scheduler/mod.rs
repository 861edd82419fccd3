use crate::{config, TrainingError};

/// Per-epoch learning-rate schedule. `learning_rate` is the rate for the
/// current epoch; `step` moves to the next epoch and returns its rate.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn epoch(&self) -> usize;
}

/// Factor applied to the base rate during the warm-up epoch.
pub const WARMUP_FACTOR: f64 = 0.1;

/// Piecewise-constant decay: the base rate is multiplied by `gamma` once for
/// every milestone the epoch has reached.
///
/// The rate depends only on the epoch index, so a schedule created at the
/// epoch a run resumes from follows the same trajectory as an uninterrupted
/// one. With `warmup_epoch0` the very first epoch runs at a tenth of the base
/// rate.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    warmup_epoch0: bool,
    epoch: usize,
}

impl MultiStepLr {
    pub fn new(
        base_lr: f64,
        milestones: Vec<usize>,
        gamma: f64,
        start_epoch: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires a positive base learning rate",
            ));
        }
        if milestones.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(TrainingError::initialization(
                "scheduler milestones must be strictly increasing",
            ));
        }
        Ok(Self {
            base_lr,
            milestones,
            gamma,
            warmup_epoch0: false,
            epoch: start_epoch,
        })
    }

    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        start_epoch: usize,
    ) -> Result<Self, TrainingError> {
        Self::new(base_lr, cfg.milestones.clone(), cfg.gamma, start_epoch)
    }

    pub fn with_warmup(mut self, enabled: bool) -> Self {
        self.warmup_epoch0 = enabled;
        self
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        if self.warmup_epoch0 && epoch == 0 {
            return self.base_lr * WARMUP_FACTOR;
        }
        let decays = self
            .milestones
            .iter()
            .filter(|&&milestone| milestone <= epoch)
            .count();
        self.base_lr * self.gamma.powi(decays as i32)
    }
}

impl LRScheduler for MultiStepLr {
    fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    fn default_schedule(start_epoch: usize) -> MultiStepLr {
        MultiStepLr::new(0.1, vec![100, 150], 0.1, start_epoch).unwrap()
    }

    #[test]
    fn decays_at_milestones() {
        let schedule = default_schedule(0);
        assert!(close(schedule.lr_at(0), 0.1));
        assert!(close(schedule.lr_at(99), 0.1));
        assert!(close(schedule.lr_at(100), 0.01));
        assert!(close(schedule.lr_at(149), 0.01));
        assert!(close(schedule.lr_at(150), 0.001));
        assert!(close(schedule.lr_at(199), 0.001));
    }

    #[test]
    fn resume_reproduces_trajectory() {
        let mut fresh = default_schedule(0);
        for _ in 0..120 {
            fresh.step();
        }
        let resumed = default_schedule(120);
        assert_eq!(resumed.epoch(), 120);
        assert!(close(resumed.learning_rate(), 0.01));
        assert!(close(fresh.learning_rate(), resumed.learning_rate()));
    }

    #[test]
    fn warmup_only_affects_first_epoch() {
        let mut schedule = default_schedule(0).with_warmup(true);
        assert!(close(schedule.learning_rate(), 0.01));
        assert!(close(schedule.step(), 0.1));

        let resumed = default_schedule(5).with_warmup(true);
        assert!(close(resumed.learning_rate(), 0.1));
    }

    #[test]
    fn rejects_unordered_milestones() {
        assert!(MultiStepLr::new(0.1, vec![150, 100], 0.1, 0).is_err());
        assert!(MultiStepLr::new(0.0, vec![100], 0.1, 0).is_err());
    }
}
