use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{
    cifar::{transform_image, Augmentation, CifarDataset, CHANNELS, IMAGE_BYTES, IMAGE_SIZE},
    Batch, BatchIter, BatchSource, Result,
};
use crate::{config::to_runtime_error, TrainingError};

/// Batches over a [`CifarDataset`].
///
/// With `workers > 0` images are decoded and augmented on a background
/// thread that stays at most `workers` batches ahead of the consumer.
pub struct ImageLoader {
    dataset: Arc<CifarDataset>,
    batch_size: usize,
    shuffle: bool,
    augmentation: Augmentation,
    seed: u64,
    workers: usize,
    device: Device,
}

impl ImageLoader {
    pub fn new(dataset: CifarDataset, batch_size: usize, device: Device) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if dataset.is_empty() {
            return Err(TrainingError::initialization("dataset contains no images"));
        }
        Ok(Self {
            dataset: Arc::new(dataset),
            batch_size,
            shuffle: false,
            augmentation: Augmentation::None,
            seed: 0,
            workers: 0,
            device,
        })
    }

    /// Reshuffles every epoch from `seed` and the epoch index.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn with_augmentation(mut self, augmentation: Augmentation) -> Self {
        self.augmentation = augmentation;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    fn plan(&self, epoch: usize) -> EpochPlan {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        let epoch_seed = self.seed.wrapping_add(epoch as u64);
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(epoch_seed));
        }
        EpochPlan {
            dataset: Arc::clone(&self.dataset),
            order,
            batch_size: self.batch_size,
            augmentation: self.augmentation,
            rng: StdRng::seed_from_u64(epoch_seed ^ 0x9e37_79b9_7f4a_7c15),
            cursor: 0,
        }
    }
}

impl BatchSource for ImageLoader {
    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn batches(&mut self, epoch: usize) -> Result<BatchIter<'_>> {
        let plan = self.plan(epoch);
        let device = self.device.clone();
        if self.workers == 0 {
            return Ok(Box::new(plan.map(move |host| host.into_batch(&device))));
        }
        Ok(Box::new(Prefetch::spawn(plan, self.workers, device)?))
    }
}

/// Host-side batch before it is moved to the device.
struct HostBatch {
    images: Vec<f32>,
    labels: Vec<u32>,
}

impl HostBatch {
    fn into_batch(self, device: &Device) -> Result<Batch> {
        let count = self.labels.len();
        let images = Tensor::from_vec(self.images, (count, CHANNELS, IMAGE_SIZE, IMAGE_SIZE), device)
            .map_err(to_runtime_error)?;
        let labels = Tensor::from_vec(self.labels, count, device).map_err(to_runtime_error)?;
        Batch::new(images, labels)
    }
}

struct EpochPlan {
    dataset: Arc<CifarDataset>,
    order: Vec<usize>,
    batch_size: usize,
    augmentation: Augmentation,
    rng: StdRng,
    cursor: usize,
}

impl Iterator for EpochPlan {
    type Item = HostBatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let mut images = vec![0f32; indices.len() * IMAGE_BYTES];
        let mut labels = Vec::with_capacity(indices.len());
        for (slot, &index) in images.chunks_exact_mut(IMAGE_BYTES).zip(indices) {
            transform_image(self.dataset.image(index), self.augmentation, &mut self.rng, slot);
            labels.push(self.dataset.label(index) as u32);
        }
        Some(HostBatch { images, labels })
    }
}

struct Prefetch {
    receiver: Option<Receiver<HostBatch>>,
    handle: Option<JoinHandle<()>>,
    device: Device,
}

impl Prefetch {
    fn spawn(plan: EpochPlan, depth: usize, device: Device) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(depth);
        let handle = thread::Builder::new()
            .name("batch-prefetch".into())
            .spawn(move || {
                for batch in plan {
                    if sender.send(batch).is_err() {
                        break;
                    }
                }
            })
            .map_err(|err| {
                TrainingError::runtime(format!("failed to spawn prefetch worker: {}", err))
            })?;
        Ok(Self {
            receiver: Some(receiver),
            handle: Some(handle),
            device,
        })
    }
}

impl Iterator for Prefetch {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let host = self.receiver.as_ref()?.recv().ok()?;
        Some(host.into_batch(&self.device))
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        // closing the channel unblocks a worker waiting on a full queue
        self.receiver.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("batch prefetch worker panicked");
            }
        }
    }
}
