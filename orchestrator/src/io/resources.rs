//! Host resource sampling for pool sizing.

use std::sync::Mutex;

use sysinfo::System;
use tracing::debug;

use crate::core::capacity::ResourceSample;

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Probe backed by `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so the first sample
/// after construction reports whatever `sysinfo` has (usually 0).
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceSample {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();
        system.refresh_cpu_usage();
        let sample = ResourceSample {
            available_memory_mb: system.available_memory() / (1024 * 1024),
            cpu_percent: system.global_cpu_usage(),
        };
        debug!(
            available_memory_mb = sample.available_memory_mb,
            cpu_percent = sample.cpu_percent,
            "resource sample"
        );
        sample
    }
}
