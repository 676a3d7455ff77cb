//! Live resource telemetry behind trait seams.
//!
//! The scheduler only sees [`HostProbe`] and [`GpuProbe`], so tests (and
//! GPU-less hosts) can swap the production probes out. Readings are
//! advisory: nothing is reserved, the scheduler re-reads every tick.

use std::sync::{Arc, Mutex};

use nvml_wrapper::Nvml;
use sysinfo::System;
use tracing::warn;

/// Host memory snapshot, bytes.
#[derive(Debug, Clone, Copy)]
pub struct HostMemory {
    pub total: u64,
    pub available: u64,
}

/// One GPU's memory snapshot, bytes.
#[derive(Debug, Clone, Copy)]
pub struct GpuStat {
    pub index: u32,
    pub total: u64,
    pub free: u64,
}

pub trait HostProbe: Send {
    /// Instantaneous CPU utilization, 0–100. The first reading after
    /// construction may be zero; the tick cadence makes later ones real.
    fn cpu_percent(&mut self) -> f32;

    fn memory(&mut self) -> HostMemory;
}

pub trait GpuProbe: Send {
    /// All visible GPUs in index order; empty when none.
    fn gpus(&mut self) -> Vec<GpuStat>;
}

/// Production host probe backed by sysinfo.
pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        SysinfoProbe { sys: System::new() }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        SysinfoProbe::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn cpu_percent(&mut self) -> f32 {
        self.sys.refresh_cpu_usage();
        self.sys.global_cpu_usage()
    }

    fn memory(&mut self) -> HostMemory {
        self.sys.refresh_memory();
        HostMemory {
            total: self.sys.total_memory(),
            available: self.sys.available_memory(),
        }
    }
}

/// Production GPU probe backed by NVML. When the NVIDIA driver is absent
/// the probe degrades to reporting no GPUs, which parks every task at the
/// train gate rather than failing the scheduler.
pub struct NvmlProbe {
    nvml: Option<Nvml>,
}

impl NvmlProbe {
    pub fn new() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                warn!("NVML unavailable ({e}); assuming no GPUs");
                None
            }
        };
        NvmlProbe { nvml }
    }
}

impl Default for NvmlProbe {
    fn default() -> Self {
        NvmlProbe::new()
    }
}

impl GpuProbe for NvmlProbe {
    fn gpus(&mut self) -> Vec<GpuStat> {
        let Some(nvml) = &self.nvml else {
            return Vec::new();
        };
        let count = nvml.device_count().unwrap_or(0);
        (0..count)
            .filter_map(|index| {
                let device = nvml.device_by_index(index).ok()?;
                let memory = device.memory_info().ok()?;
                Some(GpuStat {
                    index,
                    total: memory.total,
                    free: memory.free,
                })
            })
            .collect()
    }
}

/// Fixed-reading probes for tests and for driving the scheduler on hosts
/// without real telemetry. The shared handles let a test adjust readings
/// while a scheduler is running.
#[derive(Clone)]
pub struct StaticHostProbe {
    cpu_percent: Arc<Mutex<f32>>,
    memory: Arc<Mutex<HostMemory>>,
}

impl StaticHostProbe {
    pub fn new(cpu_percent: f32, memory: HostMemory) -> Self {
        StaticHostProbe {
            cpu_percent: Arc::new(Mutex::new(cpu_percent)),
            memory: Arc::new(Mutex::new(memory)),
        }
    }

    pub fn set_cpu_percent(&self, value: f32) {
        *self.cpu_percent.lock().expect("probe lock poisoned") = value;
    }

    pub fn set_memory(&self, memory: HostMemory) {
        *self.memory.lock().expect("probe lock poisoned") = memory;
    }
}

impl HostProbe for StaticHostProbe {
    fn cpu_percent(&mut self) -> f32 {
        *self.cpu_percent.lock().expect("probe lock poisoned")
    }

    fn memory(&mut self) -> HostMemory {
        *self.memory.lock().expect("probe lock poisoned")
    }
}

#[derive(Clone)]
pub struct StaticGpuProbe {
    gpus: Arc<Mutex<Vec<GpuStat>>>,
}

impl StaticGpuProbe {
    pub fn new(gpus: Vec<GpuStat>) -> Self {
        StaticGpuProbe {
            gpus: Arc::new(Mutex::new(gpus)),
        }
    }

    pub fn set_gpus(&self, gpus: Vec<GpuStat>) {
        *self.gpus.lock().expect("probe lock poisoned") = gpus;
    }
}

impl GpuProbe for StaticGpuProbe {
    fn gpus(&mut self) -> Vec<GpuStat> {
        self.gpus.lock().expect("probe lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_probes_report_what_they_are_told() {
        let mut host = StaticHostProbe::new(
            12.5,
            HostMemory {
                total: 100,
                available: 40,
            },
        );
        assert_eq!(host.cpu_percent(), 12.5);
        host.set_cpu_percent(99.0);
        assert_eq!(host.cpu_percent(), 99.0);

        let mut gpu = StaticGpuProbe::new(vec![GpuStat {
            index: 0,
            total: 10,
            free: 5,
        }]);
        assert_eq!(gpu.gpus().len(), 1);
        gpu.set_gpus(Vec::new());
        assert!(gpu.gpus().is_empty());
    }
}
