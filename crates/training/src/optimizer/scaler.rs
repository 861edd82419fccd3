use candle_core::{DType, Tensor};

use crate::{config::to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Dynamic loss scaling for reduced-precision training.
///
/// The loss is multiplied by the current scale before backprop and the
/// gradients divided by it afterwards. A step whose gradients are not finite
/// is skipped and the scale backs off; `growth_interval` clean steps in a row
/// grow it again.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    loss_scale: f32,
    stable_steps: usize,
    skipped_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new() -> Self {
        Self::with_config(LossScaleConfig::default())
    }

    pub fn with_config(config: LossScaleConfig) -> Self {
        let config = sanitize_config(config);
        Self {
            loss_scale: config.initial_scale,
            stable_steps: 0,
            skipped_steps: 0,
            config,
        }
    }

    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    /// Steps skipped because of non-finite gradients since construction.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        tensor
            .affine(self.loss_scale as f64, 0.0)
            .map_err(to_runtime_error)
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        let scale = 1.0 / self.loss_scale as f64;
        tensor.affine(scale, 0.0).map_err(to_runtime_error)
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.loss_scale = (self.loss_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
            self.skipped_steps += 1;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.config.growth_interval {
                self.loss_scale =
                    (self.loss_scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_steps = 0;
            }
        }
    }
}

impl Default for GradientScaler {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .abs()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}
