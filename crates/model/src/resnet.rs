//! Residual networks for 32x32 inputs.
//!
//! Three stages of 16, 32 and 64 channels, each made of `n` basic blocks, for
//! a total depth of `6n + 2`. Downsampling blocks use a parameter-free
//! shortcut: the input is subsampled with stride 2 and zero-padded along the
//! channel axis, so every variant has the same parameter layout per block.
//! Variable names follow the usual `layer{stage}.{block}.conv1.weight`
//! convention.
//!
//! Batch normalisation always keeps its affine parameters and running
//! statistics in `F32`; half-precision activations are cast around it.

use std::{collections::HashMap, sync::MutexGuard};

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, Module,
    ModuleT, VarBuilder, VarMap,
};

use crate::{ImageClassifier, Mode, ParameterBlob};

const STAGE_CHANNELS: [usize; 3] = [16, 32, 64];
const INPUT_CHANNELS: usize = 3;
const BATCH_NORM_EPS: f64 = 1e-5;
const BUFFER_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];

#[derive(Debug, Clone)]
pub struct ResNetConfig {
    pub name: String,
    pub blocks_per_stage: usize,
    pub num_classes: usize,
    pub dtype: DType,
    pub device: Device,
}

impl ResNetConfig {
    /// Configuration for a network of the given total depth (`6n + 2`).
    pub fn with_depth(
        name: impl Into<String>,
        depth: usize,
        num_classes: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        if depth < 8 || (depth - 2) % 6 != 0 {
            return Err(Error::Msg(format!(
                "resnet depth must be of the form 6n + 2 with n >= 1 (got {depth})"
            )));
        }
        Ok(Self {
            name: name.into(),
            blocks_per_stage: (depth - 2) / 6,
            num_classes,
            dtype,
            device,
        })
    }

    pub fn depth(&self) -> usize {
        6 * self.blocks_per_stage + 2
    }

    fn validate(&self) -> Result<()> {
        if self.blocks_per_stage == 0 {
            return Err(Error::Msg("resnet requires at least one block per stage".into()));
        }
        if self.num_classes == 0 {
            return Err(Error::Msg("resnet requires at least one output class".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "resnet parameters must use a floating dtype (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }
}

/// Batch norm evaluated in `F32` regardless of the activation dtype.
struct Norm {
    inner: BatchNorm,
    activation_dtype: DType,
}

impl Norm {
    fn new(features: usize, activation_dtype: DType, vb: VarBuilder) -> Result<Self> {
        let inner = batch_norm(features, BATCH_NORM_EPS, vb.to_dtype(DType::F32))?;
        Ok(Self {
            inner,
            activation_dtype,
        })
    }
}

impl ModuleT for Norm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if self.activation_dtype == DType::F32 {
            return xs.apply_t(&self.inner, train);
        }
        xs.to_dtype(DType::F32)?
            .apply_t(&self.inner, train)?
            .to_dtype(self.activation_dtype)
    }
}

enum Shortcut {
    Identity,
    Subsample { channel_pad: usize },
}

impl Shortcut {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Shortcut::Identity => Ok(xs.clone()),
            Shortcut::Subsample { channel_pad } => {
                let (batch, channels, height, width) = xs.dims4()?;
                if height % 2 != 0 || width % 2 != 0 {
                    return Err(Error::Msg(format!(
                        "downsampling shortcut expects even spatial dims (got {height}x{width})"
                    )));
                }
                let strided = xs
                    .reshape((batch, channels, height / 2, 2, width / 2, 2))?
                    .narrow(3, 0, 1)?
                    .narrow(5, 0, 1)?
                    .reshape((batch, channels, height / 2, width / 2))?;
                strided.pad_with_zeros(1, *channel_pad, *channel_pad)
            }
        }
    }
}

struct BasicBlock {
    conv1: Conv2d,
    bn1: Norm,
    conv2: Conv2d,
    bn2: Norm,
    shortcut: Shortcut,
}

impl BasicBlock {
    fn new(in_planes: usize, planes: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let dtype = vb.dtype();
        let conv1 = conv2d_no_bias(in_planes, planes, 3, conv3x3(stride), vb.pp("conv1"))?;
        let bn1 = Norm::new(planes, dtype, vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(planes, planes, 3, conv3x3(1), vb.pp("conv2"))?;
        let bn2 = Norm::new(planes, dtype, vb.pp("bn2"))?;
        let shortcut = if stride != 1 || in_planes != planes {
            Shortcut::Subsample {
                channel_pad: planes / 4,
            }
        } else {
            Shortcut::Identity
        };
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.conv1.forward(xs)?.apply_t(&self.bn1, train)?.relu()?;
        let out = self.conv2.forward(&out)?.apply_t(&self.bn2, train)?;
        let residual = self.shortcut.forward(xs)?;
        (out + residual)?.relu()
    }
}

fn conv3x3(stride: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    }
}

pub struct ResNet {
    config: ResNetConfig,
    varmap: VarMap,
    conv1: Conv2d,
    bn1: Norm,
    blocks: Vec<BasicBlock>,
    head: Linear,
    mode: Mode,
}

impl ResNet {
    pub fn new(config: ResNetConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let conv1 = conv2d_no_bias(
            INPUT_CHANNELS,
            STAGE_CHANNELS[0],
            3,
            conv3x3(1),
            vb.pp("conv1"),
        )?;
        let bn1 = Norm::new(STAGE_CHANNELS[0], config.dtype, vb.pp("bn1"))?;

        let mut blocks = Vec::with_capacity(STAGE_CHANNELS.len() * config.blocks_per_stage);
        let mut in_planes = STAGE_CHANNELS[0];
        for (stage, &planes) in STAGE_CHANNELS.iter().enumerate() {
            let stage_vb = vb.pp(format!("layer{}", stage + 1));
            for index in 0..config.blocks_per_stage {
                let stride = if stage > 0 && index == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::new(
                    in_planes,
                    planes,
                    stride,
                    stage_vb.pp(index.to_string()),
                )?);
                in_planes = planes;
            }
        }

        let head = linear(in_planes, config.num_classes, vb.pp("linear"))?;

        Ok(Self {
            config,
            varmap,
            conv1,
            bn1,
            blocks,
            head,
            mode: Mode::Train,
        })
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    /// Every variable including normalisation buffers, sorted by name.
    fn named_variables(&self) -> Vec<(String, Var)> {
        let data = lock_vars(&self.varmap);
        let mut vars: Vec<_> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }
}

fn lock_vars(varmap: &VarMap) -> MutexGuard<'_, HashMap<String, Var>> {
    match varmap.data().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ImageClassifier for ResNet {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = images.dims4()?;
        if channels != INPUT_CHANNELS {
            return Err(Error::Msg(format!(
                "resnet expects {INPUT_CHANNELS} input channels (got {channels})"
            )));
        }
        let train = self.mode.is_train();
        let mut hidden = self
            .conv1
            .forward(images)?
            .apply_t(&self.bn1, train)?
            .relu()?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, train)?;
        }
        let pooled = hidden.mean((2, 3))?;
        self.head.forward(&pooled)
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        self.named_variables()
            .into_iter()
            .filter(|(name, _)| !BUFFER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
            .collect()
    }

    fn export_parameters(&self) -> Result<ParameterBlob> {
        let tensors: Vec<(String, Tensor)> = self
            .named_variables()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        let bytes = safetensors::tensor::serialize(tensors, &None)
            .map_err(|err| Error::Msg(format!("failed to serialize parameters: {err}")))?;
        Ok(ParameterBlob::from_bytes(bytes))
    }

    fn import_parameters(&mut self, blob: &ParameterBlob) -> Result<()> {
        let mut loaded = candle_core::safetensors::load_buffer(blob.as_bytes(), &self.config.device)?;

        for (name, var) in self.named_variables() {
            let tensor = loaded
                .remove(&name)
                .ok_or_else(|| Error::Msg(format!("parameter blob missing {name}")))?;
            let current = var.as_tensor();
            if tensor.dims() != current.dims() {
                return Err(Error::Msg(format!(
                    "parameter {name} has shape {:?} in blob but {:?} in model",
                    tensor.dims(),
                    current.dims()
                )));
            }
            let tensor = if tensor.dtype() == current.dtype() {
                tensor
            } else {
                tensor.to_dtype(current.dtype())?
            };
            var.set(&tensor)?;
        }

        if !loaded.is_empty() {
            let mut extra: Vec<_> = loaded.into_keys().collect();
            extra.sort();
            return Err(Error::Msg(format!(
                "parameter blob contains unused entries: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    fn dtype(&self) -> DType {
        self.config.dtype
    }

    fn device(&self) -> &Device {
        &self.config.device
    }
}
