pub mod scaler;

pub use scaler::{GradientScaler, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{
    config::{self, to_runtime_error},
    TrainingError,
};

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for SgdConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            momentum: value.momentum,
            weight_decay: value.weight_decay,
        }
    }
}

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay.
///
/// For every parameter `p` with gradient `g`:
///
/// ```text
/// d   = g + weight_decay * p
/// buf = momentum * buf + d      (buf = d on the first update)
/// p   = p - lr * buf
/// ```
///
/// Arithmetic runs in `F32`. Parameters stored in a reduced dtype keep an
/// `F32` master copy which receives the update and is cast back afterwards.
#[derive(Debug)]
pub struct Sgd {
    config: SgdConfig,
    params: Vec<ParameterSlot>,
    steps: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    momentum_buffer: Option<Tensor>,
}

impl Sgd {
    pub fn new(named_parameters: Vec<(String, Var)>, config: SgdConfig) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            let dtype = tensor.dtype();
            if !dtype.is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                momentum_buffer: None,
            });
        }

        Ok(Self {
            config,
            params,
            steps: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// Re-reads every parameter after it was overwritten outside the
    /// optimizer, e.g. by a checkpoint import. Master copies are refreshed
    /// and momentum buffers cleared.
    pub fn reload_parameters(&mut self) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            if let Some(master) = slot.master.as_ref() {
                let fp32 = slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                master.set(&fp32).map_err(to_runtime_error)?;
            }
            slot.momentum_buffer = None;
        }
        Ok(())
    }

    /// Removes this optimizer's gradients from `grads`, promoted to `F32` and
    /// aligned with the parameter order. Parameters that did not take part
    /// in the graph yield `None`.
    pub fn take_gradients(&self, grads: &mut GradStore) -> Result<Vec<Option<Tensor>>, TrainingError> {
        self.params
            .iter()
            .map(|slot| {
                grads
                    .remove(slot.param.as_tensor())
                    .map(|grad| grad.to_dtype(DType::F32).map_err(to_runtime_error))
                    .transpose()
            })
            .collect()
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let gradients = self.take_gradients(grads)?;
        self.apply(gradients)
    }

    /// Applies one update from gradients produced by [`Sgd::take_gradients`].
    pub fn apply(&mut self, gradients: Vec<Option<Tensor>>) -> Result<(), TrainingError> {
        if gradients.len() != self.params.len() {
            return Err(TrainingError::runtime(format!(
                "optimizer expected {} gradients, received {}",
                self.params.len(),
                gradients.len()
            )));
        }

        let cfg = self.config;
        for (slot, grad) in self.params.iter_mut().zip(gradients) {
            let Some(grad) = grad else {
                continue;
            };

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };

            let d_p = if cfg.weight_decay != 0.0 {
                let decay = base.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let direction = if cfg.momentum != 0.0 {
                let buffer = match slot.momentum_buffer.take() {
                    Some(prev) => prev
                        .affine(cfg.momentum, 0.0)
                        .map_err(to_runtime_error)?
                        .add(&d_p)
                        .map_err(to_runtime_error)?,
                    None => d_p,
                };
                slot.momentum_buffer = Some(buffer.clone());
                buffer
            } else {
                d_p
            };

            let update = direction
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;
        }

        self.steps += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar_param(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap()
    }

    fn grad_of_square(param: &Var) -> GradStore {
        // d/dp (p^2 / 2) = p
        let loss = param.as_tensor().sqr().unwrap().affine(0.5, 0.0).unwrap().sum_all().unwrap();
        loss.backward().unwrap()
    }

    fn value(param: &Var) -> f32 {
        param.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn plain_sgd_follows_gradient() {
        let param = scalar_param(2.0);
        let mut sgd = Sgd::new(
            vec![("w".into(), param.clone())],
            SgdConfig {
                learning_rate: 0.5,
                momentum: 0.0,
                weight_decay: 0.0,
            },
        )
        .unwrap();

        sgd.step(&mut grad_of_square(&param)).unwrap();
        assert!((value(&param) - 1.0).abs() < 1e-6);
        assert_eq!(sgd.steps(), 1);
    }

    #[test]
    fn momentum_and_weight_decay_accumulate() {
        let param = scalar_param(1.0);
        let mut sgd = Sgd::new(
            vec![("w".into(), param.clone())],
            SgdConfig {
                learning_rate: 0.1,
                momentum: 0.9,
                weight_decay: 0.1,
            },
        )
        .unwrap();

        // step 1: d = 1 + 0.1 = 1.1, buf = 1.1, p = 1 - 0.11 = 0.89
        sgd.step(&mut grad_of_square(&param)).unwrap();
        assert!((value(&param) - 0.89).abs() < 1e-6);

        // step 2: d = 0.89 * 1.1 = 0.979, buf = 0.99 + 0.979 = 1.969
        sgd.step(&mut grad_of_square(&param)).unwrap();
        assert!((value(&param) - (0.89 - 0.1969)).abs() < 1e-5);
    }

    #[test]
    fn half_parameters_keep_master_weights() {
        let tensor = Tensor::new(&[2.0f32], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let param = Var::from_tensor(&tensor).unwrap();
        let mut sgd = Sgd::new(
            vec![("w".into(), param.clone())],
            SgdConfig {
                learning_rate: 0.5,
                momentum: 0.0,
                weight_decay: 0.0,
            },
        )
        .unwrap();

        let grad = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        sgd.apply(vec![Some(grad)]).unwrap();

        assert_eq!(param.as_tensor().dtype(), DType::F16);
        let updated = param
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(updated, vec![1.5]);
    }

    #[test]
    fn reload_picks_up_externally_set_half_parameters() {
        let half = |value: f32| {
            Tensor::new(&[value], &Device::Cpu)
                .unwrap()
                .to_dtype(DType::F16)
                .unwrap()
        };
        let param = Var::from_tensor(&half(1.0)).unwrap();
        let mut sgd = Sgd::new(
            vec![("w".into(), param.clone())],
            SgdConfig {
                learning_rate: 1e-6,
                momentum: 0.9,
                weight_decay: 0.0,
            },
        )
        .unwrap();

        param.set(&half(5.0)).unwrap();
        sgd.reload_parameters().unwrap();
        sgd.apply(vec![Some(Tensor::new(&[0.0f32], &Device::Cpu).unwrap())])
            .unwrap();

        let updated = param
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(updated, vec![5.0]);
    }

    #[test]
    fn missing_gradients_leave_parameter_untouched() {
        let param = scalar_param(3.0);
        let mut sgd = Sgd::new(
            vec![("w".into(), param.clone())],
            SgdConfig {
                learning_rate: 1.0,
                momentum: 0.9,
                weight_decay: 0.0,
            },
        )
        .unwrap();
        sgd.apply(vec![None]).unwrap();
        assert_eq!(value(&param), 3.0);
        assert!(sgd.apply(vec![]).is_err());
    }
}
