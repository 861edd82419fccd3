//! Execution of a single optimisation step, with or without loss scaling.

use candle_core::Tensor;
use model::ImageClassifier;

use crate::{
    config::to_runtime_error,
    data::Batch,
    loss::CrossEntropyLoss,
    optimizer::{GradientScaler, LossScaleConfig, Sgd},
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Detached class scores of the forward pass.
    pub logits: Tensor,
    pub loss: f64,
    /// `false` when the update was skipped because of non-finite gradients.
    pub applied: bool,
}

/// Runs forward, loss, backward and the parameter update for one batch.
///
/// Gradients are produced fresh for every call; nothing accumulates across
/// steps.
pub trait PrecisionStrategy {
    fn name(&self) -> &'static str;

    fn execute_step(
        &mut self,
        model: &dyn ImageClassifier,
        optimizer: &mut Sgd,
        criterion: &CrossEntropyLoss,
        batch: &Batch,
    ) -> Result<StepOutput, TrainingError>;
}

pub fn build_strategy(amp: bool) -> Box<dyn PrecisionStrategy> {
    if amp {
        Box::new(Scaled::new(LossScaleConfig::default()))
    } else {
        Box::new(Direct)
    }
}

fn forward(model: &dyn ImageClassifier, batch: &Batch) -> Result<Tensor, TrainingError> {
    let images = batch
        .images
        .to_device(model.device())
        .and_then(|images| images.to_dtype(model.dtype()))
        .map_err(to_runtime_error)?;
    model.forward(&images).map_err(to_runtime_error)
}

/// Full-precision step.
#[derive(Debug, Default)]
pub struct Direct;

impl PrecisionStrategy for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn execute_step(
        &mut self,
        model: &dyn ImageClassifier,
        optimizer: &mut Sgd,
        criterion: &CrossEntropyLoss,
        batch: &Batch,
    ) -> Result<StepOutput, TrainingError> {
        let logits = forward(model, batch)?;
        let loss = criterion.compute(&logits, &batch.labels)?;
        let mut grads = loss.loss.backward().map_err(to_runtime_error)?;
        optimizer.step(&mut grads)?;
        Ok(StepOutput {
            logits: logits.detach(),
            loss: loss.value,
            applied: true,
        })
    }
}

/// Reduced-precision step with dynamic loss scaling.
///
/// The forward pass runs in the model's parameter dtype and the loss in
/// `F32`. A step whose loss or unscaled gradients are not finite leaves the
/// parameters untouched and shrinks the scale.
#[derive(Debug)]
pub struct Scaled {
    scaler: GradientScaler,
}

impl Scaled {
    pub fn new(config: LossScaleConfig) -> Self {
        Self {
            scaler: GradientScaler::with_config(config),
        }
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.loss_scale()
    }

    pub fn skipped_steps(&self) -> usize {
        self.scaler.skipped_steps()
    }
}

impl PrecisionStrategy for Scaled {
    fn name(&self) -> &'static str {
        "scaled"
    }

    fn execute_step(
        &mut self,
        model: &dyn ImageClassifier,
        optimizer: &mut Sgd,
        criterion: &CrossEntropyLoss,
        batch: &Batch,
    ) -> Result<StepOutput, TrainingError> {
        let logits = forward(model, batch)?;
        let loss = criterion.compute(&logits, &batch.labels)?;

        let scaled = self.scaler.scale(&loss.loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;
        let gradients = optimizer
            .take_gradients(&mut grads)?
            .into_iter()
            .map(|grad| grad.map(|grad| self.scaler.unscale(&grad)).transpose())
            .collect::<Result<Vec<_>, _>>()?;

        let found_inf =
            !loss.value.is_finite() || self.scaler.has_overflow(gradients.iter().flatten())?;
        if found_inf {
            tracing::debug!(
                loss_scale = self.scaler.loss_scale(),
                "non-finite gradients, skipping step"
            );
        } else {
            optimizer.apply(gradients)?;
        }
        self.scaler.update(found_inf);

        Ok(StepOutput {
            logits: logits.detach(),
            loss: loss.value,
            applied: !found_inf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::SgdConfig;
    use candle_core::{DType, Device, Var};
    use model::{Mode, ParameterBlob, ResNet, ResNetConfig};

    fn tiny_model(dtype: DType) -> ResNet {
        let config = ResNetConfig::with_depth("resnet8", 8, 10, dtype, Device::Cpu).unwrap();
        ResNet::new(config).unwrap()
    }

    fn batch() -> Batch {
        let images = Tensor::randn(0f32, 1.0, (4, 3, 8, 8), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 1, 2, 3], &Device::Cpu).unwrap();
        Batch::new(images, labels).unwrap()
    }

    fn optimizer(model: &ResNet) -> Sgd {
        Sgd::new(
            model.trainable_parameters(),
            SgdConfig {
                learning_rate: 0.1,
                momentum: 0.9,
                weight_decay: 1e-4,
            },
        )
        .unwrap()
    }

    fn snapshot(model: &ResNet) -> Vec<Vec<f32>> {
        model
            .trainable_parameters()
            .into_iter()
            .map(|(_, var)| {
                var.as_tensor()
                    .to_dtype(DType::F32)
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn direct_step_updates_parameters() {
        let model = tiny_model(DType::F32);
        let mut sgd = optimizer(&model);
        let before = snapshot(&model);

        let output = Direct
            .execute_step(&model, &mut sgd, &CrossEntropyLoss::new(), &batch())
            .unwrap();

        assert!(output.applied);
        assert!(output.loss.is_finite());
        assert_eq!(output.logits.dims(), &[4, 10]);
        assert_ne!(before, snapshot(&model));
    }

    /// Linear classifier over flattened pixels, starting from zero weights.
    struct PixelLinear {
        weight: Var,
        mode: Mode,
        device: Device,
    }

    impl PixelLinear {
        fn new(features: usize, classes: usize) -> Self {
            let device = Device::Cpu;
            let weight =
                Var::from_tensor(&Tensor::zeros((classes, features), DType::F32, &device).unwrap())
                    .unwrap();
            Self {
                weight,
                mode: Mode::Train,
                device,
            }
        }

        fn weights(&self) -> Vec<f32> {
            self.weight.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        }
    }

    impl ImageClassifier for PixelLinear {
        fn name(&self) -> &str {
            "linear"
        }

        fn mode(&self) -> Mode {
            self.mode
        }

        fn set_mode(&mut self, mode: Mode) {
            self.mode = mode;
        }

        fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> {
            images.flatten_from(1)?.matmul(&self.weight.as_tensor().t()?)
        }

        fn trainable_parameters(&self) -> Vec<(String, Var)> {
            vec![("weight".into(), self.weight.clone())]
        }

        fn export_parameters(&self) -> candle_core::Result<ParameterBlob> {
            Ok(ParameterBlob::from_bytes(Vec::new()))
        }

        fn import_parameters(&mut self, _blob: &ParameterBlob) -> candle_core::Result<()> {
            Ok(())
        }

        fn dtype(&self) -> DType {
            DType::F32
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    #[test]
    fn overflow_skips_update_and_backs_off() {
        // Zero weights keep the loss finite while the scaled weight
        // gradient (pixels * scale) overflows F32.
        let model = PixelLinear::new(3 * 2 * 2, 4);
        let mut sgd = Sgd::new(
            model.trainable_parameters(),
            SgdConfig {
                learning_rate: 0.1,
                momentum: 0.9,
                weight_decay: 1e-4,
            },
        )
        .unwrap();
        let mut strategy = Scaled::new(LossScaleConfig {
            initial_scale: 65536.0,
            ..LossScaleConfig::default()
        });
        let images = Tensor::full(1e38f32, (2, 3, 2, 2), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
        let batch = Batch::new(images, labels).unwrap();
        let before = model.weights();

        let output = strategy
            .execute_step(&model, &mut sgd, &CrossEntropyLoss::new(), &batch)
            .unwrap();

        assert!(!output.applied);
        assert!(output.loss.is_finite());
        assert_eq!(before, model.weights());
        assert_eq!(sgd.steps(), 0);
        assert_eq!(strategy.skipped_steps(), 1);
        assert_eq!(strategy.loss_scale(), 32768.0);
    }

    #[test]
    fn non_finite_loss_skips_update() {
        let model = PixelLinear::new(3 * 2 * 2, 4);
        let mut sgd = Sgd::new(
            model.trainable_parameters(),
            SgdConfig {
                learning_rate: 0.1,
                momentum: 0.0,
                weight_decay: 0.0,
            },
        )
        .unwrap();
        let mut strategy = Scaled::new(LossScaleConfig::default());
        let images = Tensor::full(f32::NAN, (1, 3, 2, 2), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[2u32], &Device::Cpu).unwrap();
        let batch = Batch::new(images, labels).unwrap();

        let output = strategy
            .execute_step(&model, &mut sgd, &CrossEntropyLoss::new(), &batch)
            .unwrap();

        assert!(!output.applied);
        assert!(model.weights().iter().all(|w| *w == 0.0));
        assert_eq!(strategy.skipped_steps(), 1);
    }

    #[test]
    fn scaled_step_trains_half_precision_model() {
        let model = tiny_model(DType::F16);
        let mut sgd = optimizer(&model);
        let mut strategy = Scaled::new(LossScaleConfig {
            initial_scale: 128.0,
            ..LossScaleConfig::default()
        });
        let before = snapshot(&model);

        let output = strategy
            .execute_step(&model, &mut sgd, &CrossEntropyLoss::new(), &batch())
            .unwrap();

        assert!(output.applied);
        assert_eq!(output.logits.dtype(), DType::F16);
        assert_ne!(before, snapshot(&model));
    }
}
