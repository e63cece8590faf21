/// Compute device for ONNX Runtime execution providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda { device_id: i32 },
}

impl Device {
    pub const fn is_cuda(self) -> bool {
        matches!(self, Self::Cuda { .. })
    }
}

/// Inference settings fixed at startup.
///
/// The context is immutable once constructed; nothing in the pipeline mutates
/// the device or batch size after model load. Methods that run many forward
/// passes (ScoreCAM, AblationCAM) chunk their work by `batch_size`.
#[derive(Debug, Clone, Copy)]
pub struct InferenceContext {
    pub device: Device,
    pub batch_size: usize,
}

impl InferenceContext {
    pub const DEFAULT_BATCH_SIZE: usize = 32;

    pub const fn new(device: Device, batch_size: usize) -> Self {
        Self { device, batch_size }
    }

    pub const fn cpu() -> Self {
        Self::new(Device::Cpu, Self::DEFAULT_BATCH_SIZE)
    }
}

impl Default for InferenceContext {
    fn default() -> Self {
        Self::cpu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_is_cpu() {
        let ctx = InferenceContext::default();
        assert_eq!(ctx.device, Device::Cpu);
        assert_eq!(ctx.batch_size, InferenceContext::DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_cuda_device() {
        let ctx = InferenceContext::new(Device::Cuda { device_id: 1 }, 8);
        assert!(ctx.device.is_cuda());
        assert_eq!(ctx.batch_size, 8);
    }
}
