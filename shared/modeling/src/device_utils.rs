use std::{fmt, str::FromStr};

use tch::{utils::has_mps, Device, Kind};
use thiserror::Error;

fn cuda_device_count() -> usize {
    tch::Cuda::device_count() as usize
}

/// MPS on macOS if available, then the first CUDA device, then CPU.
pub fn get_optimal_device() -> Device {
    #[cfg(target_os = "macos")]
    {
        if has_mps() {
            return Device::Mps;
        }
    }
    if cuda_device_count() > 0 {
        return Device::Cuda(0);
    }
    Device::Cpu
}

/// Device a node computes on, parsed from `auto`, `cpu`, `mps`, `cuda` or `cuda:<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeDevice(pub Device);

impl Default for ComputeDevice {
    fn default() -> Self {
        Self(get_optimal_device())
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Device::Cpu => write!(f, "cpu"),
            Device::Mps => write!(f, "mps"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
            Device::Vulkan => write!(f, "vulkan"),
        }
    }
}

fn available_devices() -> String {
    let mut strings = vec!["auto".to_string(), "cpu".to_string()];
    if has_mps() {
        strings.push("mps".to_string());
    }
    strings.extend((0..cuda_device_count()).map(|idx| format!("cuda:{idx}")));
    strings.join(", ")
}

#[derive(Error, Debug)]
pub enum DeviceParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevice(String, String),

    #[error("unknown dtype '{0}', expected float32, float16 or bfloat16")]
    InvalidDtype(String),
}

impl FromStr for ComputeDevice {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        let not_available =
            |name: &str| DeviceParseError::DeviceNotAvailable(name.to_string(), available_devices());
        match s.as_str() {
            "auto" => Ok(Self::default()),
            "cpu" => Ok(Self(Device::Cpu)),
            "mps" if has_mps() => Ok(Self(Device::Mps)),
            "mps" => Err(not_available("mps")),
            "cuda" if cuda_device_count() > 0 => Ok(Self(Device::Cuda(0))),
            "cuda" => Err(not_available("cuda")),
            other => {
                let Some(idx) = other.strip_prefix("cuda:") else {
                    return Err(DeviceParseError::InvalidDevice(
                        other.to_string(),
                        available_devices(),
                    ));
                };
                let idx = idx.trim().parse::<usize>().map_err(|_| {
                    DeviceParseError::InvalidDevice(other.to_string(), available_devices())
                })?;
                if idx >= cuda_device_count() {
                    return Err(not_available(other));
                }
                Ok(Self(Device::Cuda(idx)))
            }
        }
    }
}

/// Element type the parameter arena stores weights in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputeDtype(pub Kind);

impl Default for ComputeDtype {
    fn default() -> Self {
        Self(Kind::Float)
    }
}

impl fmt::Display for ComputeDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Kind::Half => write!(f, "float16"),
            Kind::BFloat16 => write!(f, "bfloat16"),
            _ => write!(f, "float32"),
        }
    }
}

impl FromStr for ComputeDtype {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "float32" | "f32" | "fp32" => Ok(Self(Kind::Float)),
            "float16" | "f16" | "fp16" | "half" => Ok(Self(Kind::Half)),
            "bfloat16" | "bf16" => Ok(Self(Kind::BFloat16)),
            other => Err(DeviceParseError::InvalidDtype(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert!("auto".parse::<ComputeDevice>().is_ok());
        assert!("".parse::<ComputeDevice>().is_err());
        assert!("banana".parse::<ComputeDevice>().is_err());
        assert_eq!(
            "CPU".parse::<ComputeDevice>().unwrap(),
            ComputeDevice(Device::Cpu)
        );
        assert!("cuda:abc".parse::<ComputeDevice>().is_err());
        assert!("cuda:-1".parse::<ComputeDevice>().is_err());
        if cuda_device_count() == 0 {
            assert!(matches!(
                "cuda:0".parse::<ComputeDevice>(),
                Err(DeviceParseError::DeviceNotAvailable(_, _))
            ));
        } else {
            assert_eq!(
                "cuda:0".parse::<ComputeDevice>().unwrap(),
                ComputeDevice(Device::Cuda(0))
            );
        }
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!("bf16".parse::<ComputeDtype>().unwrap().0, Kind::BFloat16);
        assert_eq!("float16".parse::<ComputeDtype>().unwrap().0, Kind::Half);
        assert_eq!(ComputeDtype::default().to_string(), "float32");
        assert!("int8".parse::<ComputeDtype>().is_err());
    }
}
