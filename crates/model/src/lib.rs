//! Image classifiers consumed by the training harness.
//!
//! The harness only talks to models through [`ImageClassifier`]: a mode
//! switch, a forward pass producing per-class scores, the trainable variables
//! handed to the optimizer, and an opaque parameter export/import used by
//! checkpoints. Concrete networks live in [`resnet`] and are selected through
//! the [`registry`].

pub mod registry;
pub mod resnet;

use candle_core::{DType, Device, Result, Tensor, Var};

pub use registry::{Architecture, BuildSpec, UnknownArchitecture};
pub use resnet::{ResNet, ResNetConfig};

/// Behavioural mode of a model. Training enables batch statistics in
/// normalisation layers; evaluation uses the running estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Serialized model parameters (safetensors bytes).
///
/// Callers outside the model never inspect the contents; the blob is stored
/// and handed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBlob(Vec<u8>);

impl ParameterBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Capability set the training harness requires from a model.
pub trait ImageClassifier: Send {
    /// Registry name of the architecture, e.g. `resnet32`.
    fn name(&self) -> &str;

    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    /// Maps `(batch, channels, height, width)` images to `(batch, classes)` scores.
    fn forward(&self, images: &Tensor) -> Result<Tensor>;

    /// Named variables updated by the optimizer. Buffers such as running
    /// statistics are excluded.
    fn trainable_parameters(&self) -> Vec<(String, Var)>;

    /// Snapshot of every parameter and buffer.
    fn export_parameters(&self) -> Result<ParameterBlob>;

    /// Restores a snapshot produced by [`ImageClassifier::export_parameters`].
    fn import_parameters(&mut self, blob: &ParameterBlob) -> Result<()>;

    /// Storage dtype of the parameters; inputs are cast to it before `forward`.
    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;
}
