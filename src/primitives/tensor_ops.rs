//! Core Tensor Operations
//!
//! Device resolution, losses and small host-side helpers shared by the models,
//! the fairness regularizers and the training loop.

use crate::config::DeviceChoice;
use crate::{Result, FairHnError};
use candle_core::{Device, Tensor};
use tracing::info;

// ============================================================================
// Device Selection
// ============================================================================

/// Resolve the requested device
///
/// An explicitly requested accelerator that cannot be opened is a
/// configuration error. `Auto` tries Metal, then CUDA, then falls back to CPU.
pub fn resolve_device(choice: DeviceChoice) -> Result<Device> {
    match choice {
        DeviceChoice::Cpu => Ok(Device::Cpu),
        DeviceChoice::Cuda => Device::new_cuda(0)
            .map_err(|e| FairHnError::Config(format!("CUDA device unavailable: {}", e))),
        DeviceChoice::Metal => Device::new_metal(0)
            .map_err(|e| FairHnError::Config(format!("Metal device unavailable: {}", e))),
        DeviceChoice::Auto => Ok(best_device()),
    }
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Metal (Apple Silicon)
/// 2. CUDA (NVIDIA GPUs)
/// 3. CPU (fallback)
pub fn best_device() -> Device {
    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("🍎 Using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("🟢 Using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    info!("💻 Using CPU device");
    Device::Cpu
}

// ============================================================================
// Losses
// ============================================================================

/// Binary cross-entropy on logits, averaged over the batch
///
/// Uses the stable form `max(x, 0) - x*y + log(1 + e^(-|x|))`, which never
/// takes the log of a saturated sigmoid.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let positive = logits
        .relu()
        .map_err(|e| FairHnError::Tensor(format!("BCE relu failed: {}", e)))?;
    let xy = logits
        .mul(targets)
        .map_err(|e| FairHnError::Tensor(format!("BCE x*y failed: {}", e)))?;
    let softplus = logits
        .abs()
        .and_then(|t| t.neg())
        .and_then(|t| t.exp())
        .and_then(|t| t + 1.0)
        .and_then(|t| t.log())
        .map_err(|e| FairHnError::Tensor(format!("BCE log1p failed: {}", e)))?;

    (positive - xy)
        .and_then(|t| t + softplus)
        .and_then(|t| t.mean_all())
        .map_err(|e| FairHnError::Tensor(format!("BCE mean failed: {}", e)))
}

/// Read a scalar tensor back to the host
pub fn scalar(tensor: &Tensor) -> Result<f32> {
    tensor
        .to_dtype(candle_core::DType::F32)
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(|e| FairHnError::Tensor(format!("scalar read failed: {}", e)))
}

/// Flatten a tensor to a host vector
pub fn to_host(tensor: &Tensor) -> Result<Vec<f32>> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| FairHnError::Tensor(format!("host copy failed: {}", e)))
}
