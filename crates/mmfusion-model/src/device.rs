//! Compute device selection: CUDA > Metal > CPU.

use candle_core::Device;

/// Pick the device for a run.
///
/// With `force_cpu` the accelerators are skipped. Otherwise CUDA is tried
/// first (with the `cuda` feature), then Metal (with the `metal` feature),
/// and the CPU is the fallback.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        tracing::info!("CPU requested, skipping accelerator probe");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                tracing::info!("Using CUDA device 0");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "CUDA feature enabled but no GPU available, falling back"),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("Using Metal device 0");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "Metal feature enabled but no device available, falling back"),
        }
    }

    tracing::info!("Using CPU");
    Device::Cpu
}

/// Short name of `device` for log fields.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
