//! Picks the device layers and training run on.
//!
//! An accelerator is chosen once per process: CUDA if the `cuda` feature
//! found a GPU, then Metal, then the CPU.

use std::sync::OnceLock;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

/// The fastest available device, chosen on the first call and reused after.
pub fn accelerated_device_if_available() -> candle_core::Result<Device> {
    static DEVICE: OnceLock<Device> = OnceLock::new();
    if let Some(device) = DEVICE.get() {
        return Ok(device.clone());
    }
    let device = pick_accelerator()?;
    tracing::info!("Using the {} device", device_name(&device));
    Ok(DEVICE.get_or_init(|| device).clone())
}

fn pick_accelerator() -> candle_core::Result<Device> {
    if cuda_is_available() {
        return Device::new_cuda(0);
    }
    if metal_is_available() {
        return Device::new_metal(0);
    }
    let feature = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "metal"
    } else {
        "cuda"
    };
    tracing::info!("No accelerator found, build with `--features {feature}` to train on a GPU");
    Ok(Device::Cpu)
}

/// The CPU when `cpu` is set, otherwise [`accelerated_device_if_available`].
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    accelerated_device_if_available()
}

/// A short lowercase name for the kind of `device`.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
