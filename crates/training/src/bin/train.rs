use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use serde_json::{Number, Value};
use tracing_subscriber::EnvFilter;
use training::{
    cifar10_loaders, select_device, HalfPrecision, MetricSink, NullSink, RunContext,
    TensorBoardSink, Trainer, TracingReporter, TrainingConfig, TrainingError,
};

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Residual network training on CIFAR-10", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Optional TOML or JSON config file")]
    config: Option<PathBuf>,

    #[arg(short, long, value_name = "ARCH", help = "Model architecture (resnet20 ... resnet1202)")]
    arch: Option<String>,

    #[arg(long, value_name = "DIR", help = "Directory holding the CIFAR-10 binary files")]
    data_dir: Option<PathBuf>,

    #[arg(short = 'j', long, value_name = "N", help = "Batches prefetched by the loader")]
    workers: Option<usize>,

    #[arg(long, value_name = "N", help = "Total number of epochs to run")]
    epochs: Option<usize>,

    #[arg(long, value_name = "N", help = "Epoch to start from when not resuming")]
    start_epoch: Option<usize>,

    #[arg(short, long, value_name = "N", help = "Training mini-batch size")]
    batch_size: Option<usize>,

    #[arg(long = "lr", alias = "learning-rate", value_name = "LR", help = "Initial learning rate")]
    learning_rate: Option<f64>,

    #[arg(long, value_name = "M", help = "SGD momentum")]
    momentum: Option<f64>,

    #[arg(long, alias = "wd", value_name = "W", help = "Weight decay")]
    weight_decay: Option<f64>,

    #[arg(short, long, value_name = "N", help = "Batches between progress lines")]
    print_freq: Option<usize>,

    #[arg(long, value_name = "PATH", help = "Checkpoint directory to resume from")]
    resume: Option<PathBuf>,

    #[arg(short, long, help = "Evaluate the model on the validation set and exit")]
    evaluate: bool,

    #[arg(long, help = "Train with half-precision parameters and dynamic loss scaling")]
    amp: bool,

    #[arg(long, value_name = "DTYPE", help = "Half precision type for --amp (fp16 or bf16)")]
    amp_dtype: Option<String>,

    #[arg(long, value_name = "DIR", help = "Directory for saved checkpoints")]
    save_dir: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "Epochs between periodic checkpoints")]
    save_every: Option<usize>,

    #[arg(long, value_name = "ID", help = "Accelerator ordinal")]
    gpu_id: Option<usize>,

    #[arg(long, value_name = "SEED", help = "Seed for shuffling and augmentation")]
    seed: Option<u64>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    apply_flags(&mut config, &args)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    let device = select_device(config.runtime.gpu_id);
    if config.runtime.amp && device.is_cpu() {
        tracing::warn!("half-precision training on the CPU is slow");
    }

    let mut trainer = Trainer::from_config(&config, &device)?;
    if let Some(path) = config.runtime.resume.as_ref() {
        trainer.resume(path)?;
    }

    let (mut train_loader, mut val_loader) =
        cifar10_loaders(&config.data, config.runtime.seed, &device)?;

    let sink: Box<dyn MetricSink> = match config.tensorboard_dir() {
        Some(dir) => {
            let sink = TensorBoardSink::create(&dir, config.runtime.logging.flush_every)?;
            tracing::info!("writing metrics to {}", sink.path().display());
            Box::new(sink)
        }
        None => Box::new(NullSink),
    };
    let mut ctx = RunContext::new(
        sink,
        Box::new(TracingReporter),
        config.runtime.print_freq,
    );

    if config.runtime.evaluate {
        let top1 = trainer.evaluate(&mut val_loader, &mut ctx)?;
        tracing::info!("validation prec@1 {:.3}", top1);
        return Ok(());
    }

    let summary = trainer.fit(&mut train_loader, &mut val_loader, &mut ctx)?;
    tracing::info!(
        epochs = summary.epochs_run,
        checkpoints = summary.checkpoints.len(),
        "best prec@1 {:.3}",
        summary.best_metric
    );
    Ok(())
}

fn apply_flags(config: &mut TrainingConfig, args: &Args) -> Result<(), TrainingError> {
    if let Some(arch) = args.arch.as_ref() {
        config.model.arch = arch.clone();
    }
    if let Some(dir) = args.data_dir.as_ref() {
        config.data.directory = dir.clone();
    }
    if let Some(workers) = args.workers {
        config.data.workers = workers;
    }
    if let Some(epochs) = args.epochs {
        config.runtime.epochs = epochs;
    }
    if let Some(start_epoch) = args.start_epoch {
        config.runtime.start_epoch = start_epoch;
    }
    if let Some(batch_size) = args.batch_size {
        config.data.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.optimizer.learning_rate = lr;
    }
    if let Some(momentum) = args.momentum {
        config.optimizer.momentum = momentum;
    }
    if let Some(weight_decay) = args.weight_decay {
        config.optimizer.weight_decay = weight_decay;
    }
    if let Some(print_freq) = args.print_freq {
        config.runtime.print_freq = print_freq;
    }
    if let Some(resume) = args.resume.as_ref() {
        config.runtime.resume = Some(resume.clone());
    }
    if args.evaluate {
        config.runtime.evaluate = true;
    }
    if args.amp {
        config.runtime.amp = true;
    }
    if let Some(dtype) = args.amp_dtype.as_deref() {
        config.runtime.amp_dtype = match dtype.to_ascii_lowercase().as_str() {
            "fp16" | "f16" => HalfPrecision::Fp16,
            "bf16" => HalfPrecision::Bf16,
            other => {
                return Err(TrainingError::validation(vec![format!(
                    "unknown --amp-dtype '{other}' (expected fp16 or bf16)"
                )]))
            }
        };
    }
    if let Some(dir) = args.save_dir.as_ref() {
        config.runtime.checkpoint.directory = dir.clone();
    }
    if let Some(save_every) = args.save_every {
        config.runtime.checkpoint.save_every = save_every;
    }
    if let Some(gpu_id) = args.gpu_id {
        config.runtime.gpu_id = gpu_id;
    }
    if let Some(seed) = args.seed {
        config.runtime.seed = seed;
    }
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("invalid value after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::validation(vec![format!(
            "invalid override path '{path}'"
        )]));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| TrainingError::validation(vec!["override path must not be empty".into()]))?;
    let mut current = value;
    for segment in parents {
        current = current
            .as_object_mut()
            .and_then(|map| map.get_mut(*segment))
            .ok_or_else(|| {
                TrainingError::validation(vec![format!(
                    "override path '{path}' does not name a config section"
                )])
            })?;
    }

    let map = current.as_object_mut().ok_or_else(|| {
        TrainingError::validation(vec![format!(
            "override path '{path}' points into a non-object value"
        )])
    })?;
    map.insert((*last).to_string(), new_value);
    Ok(())
}
