//! Batch sources consumed by the epoch runners.
//!
//! A source is re-iterable: every call to [`BatchSource::batches`] starts a
//! fresh pass over the data for the given epoch. [`ImageLoader`] serves the
//! CIFAR-10 binary files with augmentation and background prefetch;
//! [`InMemorySource`] replays prepared batches.

pub mod cifar;
pub mod loader;

use candle_core::{DType, Device, Tensor};

use crate::{
    config::{to_runtime_error, DataConfig},
    TrainingError,
};

pub use cifar::{Augmentation, CifarDataset, Split};
pub use loader::ImageLoader;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// Images `(batch, channels, height, width)` with one `U32` class label each.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let (batch, _, _, _) = images.dims4().map_err(|_| {
            TrainingError::runtime(format!(
                "batch images must be (batch, channels, height, width) (got {:?})",
                images.dims()
            ))
        })?;
        if labels.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "batch labels must have shape [{batch}] (got {:?})",
                labels.dims()
            )));
        }
        if batch == 0 {
            return Err(TrainingError::runtime("batch must contain at least one example"));
        }
        let labels = if labels.dtype() == DType::U32 {
            labels
        } else {
            labels.to_dtype(DType::U32).map_err(to_runtime_error)?
        };
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait BatchSource {
    /// Batches yielded by one pass.
    fn num_batches(&self) -> usize;

    /// Starts a pass over the data. `epoch` seeds shuffling and augmentation.
    fn batches(&mut self, epoch: usize) -> Result<BatchIter<'_>>;
}

/// Training and validation loaders over the CIFAR-10 files in
/// `config.directory`. Only the training split is shuffled and augmented.
pub fn cifar10_loaders(
    config: &DataConfig,
    seed: u64,
    device: &Device,
) -> Result<(ImageLoader, ImageLoader)> {
    let train = CifarDataset::load(&config.directory, Split::Train)?;
    let test = CifarDataset::load(&config.directory, Split::Test)?;
    tracing::info!(
        train = train.len(),
        validation = test.len(),
        "loaded CIFAR-10 from {}",
        config.directory.display()
    );

    let train = ImageLoader::new(train, config.batch_size, device.clone())?
        .with_shuffle(seed)
        .with_augmentation(Augmentation::FlipAndCrop)
        .with_workers(config.workers);
    let validation = ImageLoader::new(test, config.validation_batch_size, device.clone())?
        .with_workers(config.workers);
    Ok((train, validation))
}

/// Replays the same batches, in order, on every pass.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    batches: Vec<Batch>,
}

impl InMemorySource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl BatchSource for InMemorySource {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn batches(&mut self, _epoch: usize) -> Result<BatchIter<'_>> {
        Ok(Box::new(self.batches.iter().cloned().map(Ok)))
    }
}
