use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use model::{Architecture, UnknownArchitecture};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.architecture() {
            errors.push(err.to_string());
        }

        if self.model.num_classes == 0 {
            errors.push("model.num_classes must be greater than 0".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.validation_batch_size == 0 {
            errors.push("data.validation_batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(self.scheduler.gamma > 0.0 && self.scheduler.gamma <= 1.0) {
            errors.push("scheduler.gamma must be in (0, 1]".to_string());
        }

        if self
            .scheduler
            .milestones
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            errors.push("scheduler.milestones must be strictly increasing".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.print_freq == 0 {
            errors.push("runtime.print_freq must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if self.runtime.checkpoint.save_every == 0 {
            errors.push("runtime.checkpoint.save_every must be greater than 0".to_string());
        }

        if self.runtime.logging.flush_every == 0 {
            errors.push("runtime.logging.flush_every must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.directory, base);
        absolutize_in_place(&mut self.runtime.checkpoint.directory, base);
        absolutize_in_place(&mut self.runtime.logging.tensorboard_root, base);
        if let Some(resume) = self.runtime.resume.as_mut() {
            absolutize_in_place(resume, base);
        }
    }

    /// Directory receiving metric event files for this run (`<root>/<arch>`).
    pub fn tensorboard_dir(&self) -> Option<PathBuf> {
        self.runtime
            .logging
            .enable_tensorboard
            .then(|| self.runtime.logging.tensorboard_root.join(&self.model.arch))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl ModelConfig {
    pub fn architecture(&self) -> Result<Architecture, UnknownArchitecture> {
        self.arch.parse()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: default_arch(),
            num_classes: default_num_classes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub validation_batch_size: usize,
    /// Number of batches prepared ahead of the training loop; 0 loads inline.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            directory: default_data_directory(),
            batch_size: default_batch_size(),
            validation_batch_size: default_batch_size(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_milestones")]
    pub milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            milestones: default_milestones(),
            gamma: default_gamma(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub start_epoch: usize,
    #[serde(default)]
    pub resume: Option<PathBuf>,
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
    #[serde(default)]
    pub evaluate: bool,
    #[serde(default)]
    pub amp: bool,
    #[serde(default)]
    pub amp_dtype: HalfPrecision,
    #[serde(default)]
    pub gpu_id: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Storage dtype for model parameters.
    pub fn parameter_dtype(&self) -> DType {
        if self.amp {
            self.amp_dtype.dtype()
        } else {
            DType::F32
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            start_epoch: 0,
            resume: None,
            print_freq: default_print_freq(),
            evaluate: false,
            amp: false,
            amp_dtype: HalfPrecision::default(),
            gpu_id: 0,
            seed: default_seed(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HalfPrecision {
    #[default]
    Fp16,
    Bf16,
}

impl HalfPrecision {
    pub fn dtype(self) -> DType {
        match self {
            HalfPrecision::Fp16 => DType::F16,
            HalfPrecision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_save_every")]
    pub save_every: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_directory(),
            save_every: default_save_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_tensorboard: bool,
    #[serde(default = "default_tensorboard_root")]
    pub tensorboard_root: PathBuf,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_tensorboard: true,
            tensorboard_root: default_tensorboard_root(),
            flush_every: default_flush_every(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_arch() -> String {
    Architecture::ResNet32.name().to_string()
}

fn default_num_classes() -> usize {
    10
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_batch_size() -> usize {
    128
}

fn default_workers() -> usize {
    4
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_milestones() -> Vec<usize> {
    vec![100, 150]
}

fn default_gamma() -> f64 {
    0.1
}

fn default_epochs() -> usize {
    200
}

fn default_print_freq() -> usize {
    50
}

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("save_temp")
}

fn default_save_every() -> usize {
    10
}

fn default_tensorboard_root() -> PathBuf {
    PathBuf::from("runs")
}

fn default_flush_every() -> usize {
    16
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    UnknownArchitecture(#[from] UnknownArchitecture),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_recipe() {
        let config = TrainingConfig::default();
        assert_eq!(config.model.arch, "resnet32");
        assert_eq!(config.runtime.epochs, 200);
        assert_eq!(config.data.batch_size, 128);
        assert_eq!(config.optimizer.learning_rate, 0.1);
        assert_eq!(config.optimizer.momentum, 0.9);
        assert_eq!(config.optimizer.weight_decay, 1e-4);
        assert_eq!(config.scheduler.milestones, vec![100, 150]);
        assert_eq!(config.runtime.print_freq, 50);
        assert_eq!(config.runtime.checkpoint.save_every, 10);
        assert_eq!(config.runtime.parameter_dtype(), DType::F32);
        config.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TrainingConfig::default();
        config.model.arch = "vgg16".into();
        config.data.batch_size = 0;
        config.runtime.checkpoint.save_every = 0;
        config.scheduler.milestones = vec![150, 100];

        let TrainingError::Validation(messages) = config.validate().unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(messages.len(), 4);
        assert!(messages[0].contains("unknown architecture 'vgg16'"));
    }

    #[test]
    fn loads_partial_toml_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[model]
arch = "resnet110"

[runtime]
epochs = 3
resume = "save_temp/best_checkpoint"
amp = true
amp_dtype = "bf16"
"#,
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.model.architecture().unwrap(), Architecture::ResNet110);
        assert_eq!(config.runtime.epochs, 3);
        assert_eq!(config.runtime.parameter_dtype(), DType::BF16);
        assert_eq!(
            config.runtime.resume.as_deref(),
            Some(dir.path().join("save_temp/best_checkpoint").as_path())
        );
        assert_eq!(
            config.tensorboard_dir().unwrap(),
            dir.path().join("runs").join("resnet110")
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(&path, "model: {}").unwrap();
        assert!(matches!(
            TrainingConfig::load(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
