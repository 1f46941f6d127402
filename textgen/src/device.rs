//! Device selection and numeric precision.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, DeviceLocation};

use crate::error::Result;

/// Where the model should live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevicePreference {
    /// CUDA if available, then Metal, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

/// Pick the device for a preference.
///
/// `Auto` never fails: an accelerator that reports available but cannot be
/// initialized falls back to the CPU.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
        DevicePreference::Metal(ordinal) => Ok(Device::new_metal(ordinal)?),
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                match Device::new_cuda(0) {
                    Ok(device) => {
                        tracing::info!("using CUDA device 0");
                        return Ok(device);
                    }
                    Err(e) => tracing::warn!("CUDA initialization failed: {e}"),
                }
            }
            if candle_core::utils::metal_is_available() {
                match Device::new_metal(0) {
                    Ok(device) => {
                        tracing::info!("using Metal device 0");
                        return Ok(device);
                    }
                    Err(e) => tracing::warn!("Metal initialization failed: {e}"),
                }
            }
            tracing::info!("no accelerator available, using CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Short label used in logs and reports.
pub fn device_label(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}

/// Floating-point format for the weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Bf16,
    F16,
    F32,
}

impl Precision {
    /// The dtype actually used on `device`.
    ///
    /// Half-precision matmuls are slow or missing on CPU, so reduced formats
    /// widen to F32 there.
    pub fn dtype_for(self, device: &Device) -> DType {
        match (self, device) {
            (Precision::F32, _) => DType::F32,
            (requested, Device::Cpu) => {
                tracing::warn!("{requested} requested on CPU, loading weights as f32");
                DType::F32
            }
            (Precision::Bf16, _) => DType::BF16,
            (Precision::F16, _) => DType::F16,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::Bf16 => "bf16",
            Precision::F16 => "f16",
            Precision::F32 => "f32",
        };
        f.write_str(name)
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "f16" | "fp16" | "float16" => Ok(Precision::F16),
            "f32" | "fp32" | "float32" => Ok(Precision::F32),
            other => Err(format!("unsupported dtype {other}")),
        }
    }
}
