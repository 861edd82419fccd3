use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use model::ParameterBlob;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Everything needed to continue a run: epochs completed, best validation
/// accuracy so far and the model parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    pub best_metric: f64,
    pub arch: String,
    pub model_parameters: ParameterBlob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub epoch: usize,
    /// `None` until a validation pass has produced a metric.
    pub best_metric: Option<f64>,
    pub arch: String,
    pub created_unix_timestamp: u64,
    pub model: FileRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    Best,
    /// Periodic snapshot taken after the given number of completed epochs.
    Periodic(usize),
}

impl CheckpointTag {
    pub fn directory_name(self) -> String {
        match self {
            CheckpointTag::Best => "best_checkpoint".to_string(),
            CheckpointTag::Periodic(epoch) => format!("checkpoint_{epoch}"),
        }
    }
}

/// Checkpoint directories under one root, keyed by [`CheckpointTag`].
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, tag: CheckpointTag) -> PathBuf {
        self.directory.join(tag.directory_name())
    }

    pub fn save(&self, tag: CheckpointTag, checkpoint: &Checkpoint) -> Result<PathBuf, TrainingError> {
        let path = self.path_for(tag);
        save_checkpoint(&path, checkpoint)?;
        Ok(path)
    }

    pub fn load(&self, tag: CheckpointTag) -> Result<Option<Checkpoint>, TrainingError> {
        load_checkpoint(&self.path_for(tag))
    }
}

/// Writes `checkpoint` to the directory `path`, replacing any previous one.
///
/// The files are staged in a sibling directory that is renamed into place
/// once complete, so `path` never holds a partially written checkpoint. The
/// previous checkpoint is moved aside first; if the process dies between the
/// two renames, [`load_checkpoint`] recovers from the sibling directories.
pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<CheckpointManifest, TrainingError> {
    if checkpoint.model_parameters.is_empty() {
        return Err(TrainingError::checkpoint(
            "model exported no parameters to checkpoint",
        ));
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint path has no valid directory name: {}",
                path.display()
            ))
        })?;
    fs::create_dir_all(parent).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            parent.display()
        ))
    })?;

    let staging = parent.join(format!(".{name}.tmp-{}", std::process::id()));
    remove_dir_if_exists(&staging)?;
    fs::create_dir(&staging).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create staging directory {}: {err}",
            staging.display()
        ))
    })?;

    let model_path = staging.join(MODEL_FILENAME);
    write_bytes(&model_path, checkpoint.model_parameters.as_bytes())?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        epoch: checkpoint.epoch,
        best_metric: checkpoint.best_metric.is_finite().then_some(checkpoint.best_metric),
        arch: checkpoint.arch.clone(),
        created_unix_timestamp: unix_timestamp(),
        model: file_record(&model_path)?,
    };
    write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

    let retired = parent.join(format!(".{name}.old-{}", std::process::id()));
    let replaced = if path.exists() {
        remove_dir_if_exists(&retired)?;
        rename(path, &retired)?;
        true
    } else {
        false
    };
    rename(&staging, path)?;
    if replaced {
        remove_dir_if_exists(&retired)?;
    }
    for (leftover, _) in interrupted_saves(path) {
        remove_dir_if_exists(&leftover)?;
    }

    Ok(manifest)
}

/// Reads the checkpoint directory at `path`.
///
/// Returns `Ok(None)` when there is no checkpoint there (no directory or no
/// manifest) and no interrupted save left one behind. A checkpoint that
/// exists but fails to parse or verify is an error.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>, TrainingError> {
    if path.join(MANIFEST_FILENAME).is_file() {
        return read_checkpoint(path).map(Some);
    }

    // Staged copies are newer than retired ones; unreadable leftovers are skipped.
    for (candidate, _) in interrupted_saves(path) {
        match read_checkpoint(&candidate) {
            Ok(checkpoint) => {
                tracing::warn!(
                    "no checkpoint at '{}', recovered interrupted save from '{}'",
                    path.display(),
                    candidate.display()
                );
                return Ok(Some(checkpoint));
            }
            Err(err) => tracing::debug!("ignoring {}: {err}", candidate.display()),
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Leftover {
    Staged,
    Retired,
}

/// Sibling directories left by a save of `path` that did not finish, staged
/// ones first.
fn interrupted_saves(path: &Path) -> Vec<(PathBuf, Leftover)> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
    else {
        return Vec::new();
    };
    let staged_prefix = format!(".{name}.tmp-");
    let retired_prefix = format!(".{name}.old-");
    let Ok(entries) = fs::read_dir(parent) else {
        return Vec::new();
    };

    let mut found: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let file_name = entry.file_name();
            let file_name = file_name.to_str()?;
            let kind = if file_name.starts_with(&staged_prefix) {
                Leftover::Staged
            } else if file_name.starts_with(&retired_prefix) {
                Leftover::Retired
            } else {
                return None;
            };
            Some((entry.path(), kind))
        })
        .collect();
    found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    found
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint, TrainingError> {
    let manifest_path = path.join(MANIFEST_FILENAME);
    let manifest_file = File::open(&manifest_path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", manifest_path.display()))
    })?;
    let manifest: CheckpointManifest = serde_json::from_reader(manifest_file).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to parse JSON {}: {err}",
            manifest_path.display()
        ))
    })?;
    ensure_version_supported(manifest.version)?;

    let model_path = path.join(&manifest.model.filename);
    let bytes = fs::read(&model_path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to read {}: {err}", model_path.display()))
    })?;
    if bytes.len() as u64 != manifest.model.bytes
        || hex_encode(Sha256::digest(&bytes)) != manifest.model.sha256
    {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            model_path.display()
        )));
    }

    Ok(Checkpoint {
        epoch: manifest.epoch,
        best_metric: manifest.best_metric.unwrap_or(f64::NEG_INFINITY),
        arch: manifest.arch,
        model_parameters: ParameterBlob::from_bytes(bytes),
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|err| TrainingError::checkpoint(format!("failed to write {}: {err}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    data.push(b'\n');
    write_bytes(path, &data)
}

fn rename(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to move {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn remove_dir_if_exists(path: &Path) -> Result<(), TrainingError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TrainingError::checkpoint(format!(
            "failed to remove {}: {err}",
            path.display()
        ))),
    }
}
