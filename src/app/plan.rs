use serde::{Deserialize, Serialize};

use crate::app::config::MAX_CONCURRENT_CONNECTIONS;

const FAST_MODE_BATCH_CEILING: usize = 50;
const CACHE_THRESHOLD: usize = 10;

/// Connection parameters derived from fleet size. Shared by the orchestrator and the planner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionBatchPlan {
    /// Tier size for the fleet.
    pub batch_size: usize,
    /// Devices per wave once the mode is applied.
    pub wave_size: usize,
    pub concurrency_limit: usize,
    pub fast_mode: bool,
    pub use_cache: bool,
}

pub fn base_batch_size(device_count: usize) -> usize {
    match device_count {
        0..=10 => 10,
        11..=50 => 25,
        51..=100 => 50,
        _ => 75,
    }
}

/// Devices allowed in flight at once. Mid-size fleets (11 to 30) get their own tier of 15
/// even though their waves use the 25 tier.
pub fn parallel_limit(device_count: usize) -> usize {
    let tier = match device_count {
        0..=10 => device_count.max(1),
        11..=30 => 15,
        31..=50 => 25,
        51..=100 => 50,
        _ => 75,
    };
    tier.min(MAX_CONCURRENT_CONNECTIONS)
}

/// Fast mode doubles the base size up to the ceiling, but never shrinks it.
pub fn effective_batch_size(device_count: usize, fast_mode: bool) -> usize {
    let base = base_batch_size(device_count);
    if fast_mode {
        (base * 2).min(FAST_MODE_BATCH_CEILING).max(base)
    } else {
        base
    }
}

pub fn batch_plan_for(device_count: usize, fast_mode: bool) -> ConnectionBatchPlan {
    let wave_size = effective_batch_size(device_count, fast_mode);
    ConnectionBatchPlan {
        batch_size: base_batch_size(device_count),
        wave_size,
        concurrency_limit: wave_size.min(parallel_limit(device_count)),
        fast_mode,
        use_cache: device_count > CACHE_THRESHOLD,
    }
}

/// Splits `ids` into sequential waves. A batch size at or above the count yields one wave.
pub fn partition_waves<T: Clone>(ids: &[T], batch_size: usize) -> Vec<Vec<T>> {
    if ids.is_empty() {
        return Vec::new();
    }
    let size = batch_size.max(1);
    if size >= ids.len() {
        return vec![ids.to_vec()];
    }
    ids.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

/// Rough wall-clock estimate in seconds; informational only.
pub fn estimate_connection_time(device_count: usize, fast_mode: bool) -> f64 {
    let (base, per_device) = if fast_mode { (2.0, 0.1) } else { (3.0, 0.5) };
    let overhead = match device_count {
        0..=30 => 0.0,
        31..=50 => 2.0,
        51..=100 => 4.0,
        _ => 6.0,
    };
    base + per_device * device_count as f64 / 10.0 + overhead
}
