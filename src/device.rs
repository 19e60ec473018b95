//! Compute device selection.
//!
//! The device is resolved once, at the start of an ensemble run, and then
//! passed by reference to every component that allocates or moves tensors.

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::KoopmanResult;

/// Requested compute device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA device 0 when available, otherwise CPU
    #[default]
    Auto,
    /// Always the CPU
    Cpu,
    /// A specific CUDA ordinal
    Cuda(usize),
}

impl DeviceChoice {
    /// Resolve the request into a concrete device.
    ///
    /// `Auto` never fails: a missing CUDA build or driver falls back to the
    /// CPU with a warning. An explicit `Cuda(n)` that cannot be opened is an
    /// error.
    pub fn resolve(self) -> KoopmanResult<Device> {
        let device = match self {
            DeviceChoice::Cpu => Device::Cpu,
            DeviceChoice::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceChoice::Auto => match Device::cuda_if_available(0) {
                Ok(device) => device,
                Err(err) => {
                    tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                    Device::Cpu
                }
            },
        };

        if device.is_cuda() {
            tracing::info!("Training device: CUDA ({:?})", self);
        } else {
            tracing::info!("Training device: CPU");
        }
        Ok(device)
    }
}

/// Whether host batches should be staged in pinned memory for this device.
///
/// Candle has no pinned host allocator, so the loaders only record and log
/// the hint.
pub fn pin_memory_hint(device: &Device) -> bool {
    device.is_cuda()
}
