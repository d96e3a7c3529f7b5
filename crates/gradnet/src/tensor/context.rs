//! Explicit device placement passed through model and trainer construction.
//!
//! There is deliberately no process-wide device switch: everything that touches a
//! tensor receives the context it should live on.

use std::fmt;

/// Device class a tensor may be resident on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

/// A concrete device slot, e.g. `cpu(0)` or `gpu(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    pub device: DeviceType,
    pub device_id: usize,
}

impl Context {
    pub fn cpu() -> Self {
        Context {
            device: DeviceType::Cpu,
            device_id: 0,
        }
    }

    pub fn gpu(device_id: usize) -> Self {
        Context {
            device: DeviceType::Gpu,
            device_id,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            DeviceType::Cpu => write!(f, "cpu({})", self.device_id),
            DeviceType::Gpu => write!(f, "gpu({})", self.device_id),
        }
    }
}
