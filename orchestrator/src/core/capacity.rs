//! Effective worker-pool size under resource limits.

/// Host resource reading taken before growing the pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub available_memory_mb: u64,
    /// Global CPU usage in percent (0-100).
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityLimits {
    pub max_workers: usize,
    pub min_free_memory_mb_per_worker: u64,
    pub max_cpu_percent: f32,
}

/// Number of workers allowed to run at once.
///
/// Never below `running` (running workers are never preempted) and never
/// below one, so an overloaded host slows the run down instead of stalling it.
pub fn effective_pool_size(limits: &CapacityLimits, sample: &ResourceSample, running: usize) -> usize {
    let mut allowed = limits.max_workers.max(1);
    if limits.min_free_memory_mb_per_worker > 0 {
        let by_memory = sample.available_memory_mb / limits.min_free_memory_mb_per_worker;
        allowed = allowed.min(usize::try_from(by_memory).unwrap_or(usize::MAX));
    }
    if sample.cpu_percent > limits.max_cpu_percent {
        allowed = allowed.min(running);
    }
    allowed.max(running.min(limits.max_workers)).max(1)
}
