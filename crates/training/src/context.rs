use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};

use crate::logging::{MetricSink, NullSink, ProgressReporter, SilentReporter};

/// Per-run collaborators shared by the epoch runners and the controller.
/// Tensors are placed on the model's own device.
pub struct RunContext {
    pub sink: Box<dyn MetricSink>,
    pub reporter: Box<dyn ProgressReporter>,
    /// Batches between progress records; `0` behaves like `1`.
    pub print_freq: usize,
}

impl RunContext {
    pub fn new(
        sink: Box<dyn MetricSink>,
        reporter: Box<dyn ProgressReporter>,
        print_freq: usize,
    ) -> Self {
        Self {
            sink,
            reporter,
            print_freq,
        }
    }

    /// Context without sinks or console output.
    pub fn quiet() -> Self {
        Self::new(Box::new(NullSink), Box::new(SilentReporter), 1)
    }

    pub(crate) fn should_report(&self, batch: usize) -> bool {
        batch % self.print_freq.max(1) == 0
    }
}

/// Picks the accelerator with ordinal `gpu_id`, falling back to the CPU
/// with a warning when none can be initialised.
pub fn select_device(gpu_id: usize) -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    tracing::debug!(cuda_available, metal_available, "device detection");

    if cuda_available {
        match Device::new_cuda(gpu_id) {
            Ok(device) => {
                tracing::info!("device: using CUDA GPU #{gpu_id}");
                device
            }
            Err(err) => {
                tracing::warn!("failed to initialize CUDA GPU #{gpu_id}, falling back to CPU: {err}");
                Device::Cpu
            }
        }
    } else if metal_available {
        match Device::new_metal(gpu_id) {
            Ok(device) => {
                tracing::info!("device: using Metal GPU #{gpu_id}");
                device
            }
            Err(err) => {
                tracing::warn!("failed to initialize Metal GPU #{gpu_id}, falling back to CPU: {err}");
                Device::Cpu
            }
        }
    } else {
        tracing::warn!("no GPU available, training on CPU");
        Device::Cpu
    }
}
