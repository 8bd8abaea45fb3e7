use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device as CoreDevice};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LoaderError, Result};

/// Device selection as it appears in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    /// Resolve to a concrete candle device.
    pub fn as_device(&self) -> Result<CoreDevice> {
        match self {
            Self::Auto => Ok(best_device()),
            Self::Cpu => Ok(CoreDevice::Cpu),
            Self::Cuda => {
                #[cfg(not(feature = "cuda"))]
                {
                    Err(LoaderError::invalid_input(
                        "device",
                        "CUDA support not compiled in. Rebuild with the `cuda` feature.",
                    ))
                }

                #[cfg(feature = "cuda")]
                {
                    Ok(CoreDevice::new_cuda(0)?)
                }
            }
            Self::Metal => {
                #[cfg(not(feature = "metal"))]
                {
                    Err(LoaderError::invalid_input(
                        "device",
                        "Metal support not compiled in. Rebuild on macOS with the `metal` feature.",
                    ))
                }

                #[cfg(feature = "metal")]
                {
                    Ok(CoreDevice::new_metal(0)?)
                }
            }
        }
    }
}

impl FromStr for DeviceKind {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            other => Err(LoaderError::invalid_input(
                "device",
                format!("unknown device '{}'", other),
            )),
        }
    }
}

/// Best available compute device, checked at runtime.
pub fn best_device() -> CoreDevice {
    #[cfg(all(feature = "metal", not(force_cpu)))]
    {
        if let Ok(device) = CoreDevice::new_metal(0) {
            return device;
        }
    }

    #[cfg(all(feature = "cuda", not(force_cpu)))]
    {
        if let Ok(device) = CoreDevice::new_cuda(0) {
            return device;
        }
    }

    CoreDevice::Cpu
}

/// Which of the two memory tiers a set of weights should live on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTier {
    #[default]
    #[serde(rename = "main_device")]
    Main,
    #[serde(rename = "offload_device")]
    Offload,
}

/// Explicit handle to the host's device and memory management.
///
/// Loader nodes never reach for global device state; everything goes through
/// the manager carried by the node context.
pub trait DeviceManager: Send + Sync {
    /// Device used for computation.
    fn compute_device(&self) -> &CoreDevice;

    /// Device weights are parked on when not actively computing.
    fn offload_device(&self) -> &CoreDevice;

    /// Release cached allocations before a load.
    fn soft_empty_cache(&self);

    fn device(&self, tier: DeviceTier) -> &CoreDevice {
        match tier {
            DeviceTier::Main => self.compute_device(),
            DeviceTier::Offload => self.offload_device(),
        }
    }
}

/// Default manager backed directly by candle devices.
#[derive(Clone, Debug)]
pub struct CandleDevices {
    compute: CoreDevice,
    offload: CoreDevice,
}

impl CandleDevices {
    pub fn new(compute: CoreDevice, offload: CoreDevice) -> Self {
        Self { compute, offload }
    }

    pub fn cpu() -> Self {
        Self::new(CoreDevice::Cpu, CoreDevice::Cpu)
    }

    pub fn from_kinds(compute: DeviceKind, offload: DeviceKind) -> Result<Self> {
        Ok(Self::new(compute.as_device()?, offload.as_device()?))
    }
}

impl DeviceManager for CandleDevices {
    fn compute_device(&self) -> &CoreDevice {
        &self.compute
    }

    fn offload_device(&self) -> &CoreDevice {
        &self.offload
    }

    fn soft_empty_cache(&self) {
        // candle frees on drop; syncing makes pending frees visible to the allocator
        if let Err(e) = self.compute.synchronize() {
            debug!("device synchronize failed: {}", e);
        }
    }
}

/// Numeric precision choices exposed by the loader nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp16,
    Fp32,
    #[default]
    Bf16,
}

impl Precision {
    pub const CHOICES: &'static [&'static str] = &["fp16", "fp32", "bf16"];

    pub fn dtype(&self) -> DType {
        match self {
            Self::Fp16 => DType::F16,
            Self::Fp32 => DType::F32,
            Self::Bf16 => DType::BF16,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fp16 => "fp16",
            Self::Fp32 => "fp32",
            Self::Bf16 => "bf16",
        };
        f.write_str(name)
    }
}
