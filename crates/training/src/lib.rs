pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod precision;
pub mod runner;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointStore, CheckpointTag};
pub use config::{HalfPrecision, TrainingConfig, TrainingError};
pub use context::{select_device, RunContext};
pub use data::{cifar10_loaders, Batch, BatchSource, ImageLoader, InMemorySource};
pub use logging::{
    MemorySink, MetricSink, NullSink, ProgressReporter, SilentReporter, TensorBoardSink,
    TracingReporter,
};
pub use loss::{CrossEntropyLoss, LossOutput};
pub use metrics::{accuracy, EpochStats, RunningMean};
pub use optimizer::{GradientScaler, LossScaleConfig, Sgd, SgdConfig};
pub use precision::{build_strategy, Direct, PrecisionStrategy, Scaled, StepOutput};
pub use runner::{train_epoch, validate, ValidationOutcome};
pub use scheduler::{LRScheduler, MultiStepLr};
pub use trainer::{
    checkpoints_due, SavedCheckpoint, Trainer, TrainerOptions, TrainingState, TrainingSummary,
};
