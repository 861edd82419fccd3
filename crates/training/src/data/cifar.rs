//! CIFAR-10 binary format reader and per-image augmentation.
//!
//! Each record is one label byte followed by a 32x32 image stored as three
//! 1024-byte planes (red, green, blue) in row-major order.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rand::Rng;

use crate::TrainingError;

pub const IMAGE_SIZE: usize = 32;
pub const CHANNELS: usize = 3;
pub const NUM_CLASSES: usize = 10;
pub const IMAGE_BYTES: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
const RECORD_BYTES: usize = 1 + IMAGE_BYTES;
const EXTRACTED_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILES: [&str; 1] = ["test_batch.bin"];

pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];
const CROP_PADDING: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn files(self) -> &'static [&'static str] {
        match self {
            Split::Train => &TRAIN_FILES,
            Split::Test => &TEST_FILES,
        }
    }
}

/// Decoded records of one split, kept as raw bytes.
#[derive(Debug, Clone)]
pub struct CifarDataset {
    labels: Vec<u8>,
    pixels: Vec<u8>,
}

impl CifarDataset {
    /// Reads a split from `directory`, or from its `cifar-10-batches-bin`
    /// subdirectory when the archive was extracted in place.
    pub fn load(directory: impl AsRef<Path>, split: Split) -> Result<Self, TrainingError> {
        let root = resolve_root(directory.as_ref());
        let mut labels = Vec::new();
        let mut pixels = Vec::new();

        for file in split.files() {
            let path = root.join(file);
            let bytes = fs::read(&path).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to read CIFAR-10 file {}: {}",
                    path.display(),
                    err
                ))
            })?;
            let dataset = Self::from_bytes(&bytes).map_err(|err| {
                TrainingError::initialization(format!("{}: {}", path.display(), err))
            })?;
            labels.extend(dataset.labels);
            pixels.extend(dataset.pixels);
        }

        Ok(Self { labels, pixels })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TrainingError> {
        if bytes.is_empty() || bytes.len() % RECORD_BYTES != 0 {
            return Err(TrainingError::initialization(format!(
                "CIFAR-10 data must be a non-empty multiple of {RECORD_BYTES} bytes (got {})",
                bytes.len()
            )));
        }

        let records = bytes.len() / RECORD_BYTES;
        let mut labels = Vec::with_capacity(records);
        let mut pixels = Vec::with_capacity(records * IMAGE_BYTES);
        for record in bytes.chunks_exact(RECORD_BYTES) {
            let label = record[0];
            if label as usize >= NUM_CLASSES {
                return Err(TrainingError::initialization(format!(
                    "CIFAR-10 label {label} out of range"
                )));
            }
            labels.push(label);
            pixels.extend_from_slice(&record[1..]);
        }

        Ok(Self { labels, pixels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> u8 {
        self.labels[index]
    }

    pub fn image(&self, index: usize) -> &[u8] {
        &self.pixels[index * IMAGE_BYTES..(index + 1) * IMAGE_BYTES]
    }
}

fn resolve_root(directory: &Path) -> PathBuf {
    let nested = directory.join(EXTRACTED_DIR);
    if nested.is_dir() {
        nested
    } else {
        directory.to_path_buf()
    }
}

/// Training-time transforms applied before normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Augmentation {
    None,
    /// Random horizontal flip and a random 32x32 crop of the image padded by
    /// four zero pixels on every side.
    FlipAndCrop,
}

/// Writes one normalised `CHW` image into `out`.
pub fn transform_image<R: Rng + ?Sized>(
    image: &[u8],
    augmentation: Augmentation,
    rng: &mut R,
    out: &mut [f32],
) {
    let (flip, dy, dx) = match augmentation {
        Augmentation::None => (false, CROP_PADDING, CROP_PADDING),
        Augmentation::FlipAndCrop => (
            rng.gen_bool(0.5),
            rng.gen_range(0..=2 * CROP_PADDING),
            rng.gen_range(0..=2 * CROP_PADDING),
        ),
    };

    for channel in 0..CHANNELS {
        let plane = &image[channel * IMAGE_SIZE * IMAGE_SIZE..(channel + 1) * IMAGE_SIZE * IMAGE_SIZE];
        let target = &mut out[channel * IMAGE_SIZE * IMAGE_SIZE..(channel + 1) * IMAGE_SIZE * IMAGE_SIZE];
        for y in 0..IMAGE_SIZE {
            for x in 0..IMAGE_SIZE {
                let src_y = (y + dy).checked_sub(CROP_PADDING);
                let col = if flip { IMAGE_SIZE - 1 - x } else { x };
                let src_x = (col + dx).checked_sub(CROP_PADDING);
                let raw = match (src_y, src_x) {
                    (Some(sy), Some(sx)) if sy < IMAGE_SIZE && sx < IMAGE_SIZE => {
                        plane[sy * IMAGE_SIZE + sx]
                    }
                    _ => 0,
                };
                target[y * IMAGE_SIZE + x] = (raw as f32 / 255.0 - MEAN[channel]) / STD[channel];
            }
        }
    }
}
