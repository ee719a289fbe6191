use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cuda,
    Mps,
    Cpu,
}

impl ComputeDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeDevice::Cuda => "cuda",
            ComputeDevice::Mps => "mps",
            ComputeDevice::Cpu => "cpu",
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Float16,
    Int8,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub device: ComputeDevice,
    pub precision: Precision,
}

impl DeviceProfile {
    pub fn cpu() -> Self {
        Self {
            device: ComputeDevice::Cpu,
            precision: Precision::Default,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.precision == Precision::Int8
    }
}

#[derive(Debug, Error)]
#[error("accelerator probe failed: {0}")]
pub struct ProbeError(pub String);

/// Read-only availability checks against the inference runtime.
pub trait AcceleratorProbe {
    fn primary_available(&self) -> bool;

    /// May fail on platforms that lack the alternate accelerator API.
    fn alternate_available(&self) -> Result<bool, ProbeError>;
}

/// Probe for hosts, or builds, without any accelerator.
pub struct NoAccelerators;

impl AcceleratorProbe for NoAccelerators {
    fn primary_available(&self) -> bool {
        false
    }

    fn alternate_available(&self) -> Result<bool, ProbeError> {
        Ok(false)
    }
}

/// Picks the compute device and numeric precision once at startup.
///
/// The primary accelerator wins whenever present. A failing alternate probe is
/// logged and treated as "unavailable"; the CPU is the fallback.
pub fn select_device(probe: &dyn AcceleratorProbe, load_quantized: bool) -> DeviceProfile {
    let device = if probe.primary_available() {
        ComputeDevice::Cuda
    } else {
        match probe.alternate_available() {
            Ok(true) => ComputeDevice::Mps,
            Ok(false) => ComputeDevice::Cpu,
            Err(err) => {
                tracing::debug!(%err, "alternate accelerator probe failed, ignoring");
                ComputeDevice::Cpu
            }
        }
    };

    let precision = match device {
        ComputeDevice::Cuda if load_quantized => Precision::Int8,
        ComputeDevice::Cuda | ComputeDevice::Mps => Precision::Float16,
        ComputeDevice::Cpu => Precision::Default,
    };

    let profile = DeviceProfile { device, precision };
    tracing::info!(device = %profile.device, precision = ?profile.precision, "selected compute device");
    profile
}
