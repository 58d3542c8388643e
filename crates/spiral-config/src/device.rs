use std::sync::OnceLock;

use crate::env;

/// Shape of the simulated accelerator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Worker threads backing the device's compute units.
    pub compute_units: usize,
    /// Device memory capacity in bytes.
    pub memory_bytes: u64,
    /// Upper bound on threads per block.
    pub max_threads_per_block: u32,
    /// Scratch ("shared") memory per block in bytes.
    pub shared_mem_per_block: u32,
    /// Operations a stream may hold before enqueue reports exhaustion.
    pub stream_queue_depth: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let compute_units = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            compute_units,
            memory_bytes: 4 << 30,
            max_threads_per_block: 1024,
            shared_mem_per_block: 48 * 1024,
            stream_queue_depth: 1024,
        }
    }
}

impl DeviceConfig {
    /// Reads `SPIRAL_DEVICE_*` / `SPIRAL_STREAM_QUEUE_DEPTH`, falling back to
    /// [`DeviceConfig::default`] field by field.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            compute_units: env::parse::<usize>("SPIRAL_DEVICE_COMPUTE_UNITS")
                .filter(|&units| units > 0)
                .unwrap_or(defaults.compute_units),
            memory_bytes: env::parse::<u64>("SPIRAL_DEVICE_MEMORY_MB")
                .filter(|&mb| mb > 0)
                .map(|mb| mb << 20)
                .unwrap_or(defaults.memory_bytes),
            max_threads_per_block: env::parse::<u32>("SPIRAL_DEVICE_MAX_THREADS")
                .filter(|&threads| threads > 0)
                .unwrap_or(defaults.max_threads_per_block),
            shared_mem_per_block: env::parse::<u32>("SPIRAL_DEVICE_SHARED_KB")
                .filter(|&kb| kb > 0)
                .map(|kb| kb.saturating_mul(1024))
                .unwrap_or(defaults.shared_mem_per_block),
            stream_queue_depth: env::parse::<usize>("SPIRAL_STREAM_QUEUE_DEPTH")
                .filter(|&depth| depth > 0)
                .unwrap_or(defaults.stream_queue_depth),
        }
    }
}

/// Launch tuning for the top-k kernels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopkTuning {
    /// Optional cap on lanes per block, applied after the occupancy estimate.
    pub max_threads: Option<u32>,
    /// Lanes scanned by one pool task; larger values trade balance for
    /// scheduling overhead.
    pub lanes_per_task: usize,
}

impl Default for TopkTuning {
    fn default() -> Self {
        Self {
            max_threads: None,
            lanes_per_task: 32,
        }
    }
}

impl TopkTuning {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_threads: env::parse::<u32>("SPIRAL_TOPK_MAX_THREADS").filter(|&t| t > 0),
            lanes_per_task: env::parse::<usize>("SPIRAL_TOPK_LANES_PER_TASK")
                .filter(|&lanes| lanes > 0)
                .unwrap_or(defaults.lanes_per_task),
        }
    }
}

static TOPK_TUNING: OnceLock<TopkTuning> = OnceLock::new();

/// Process-wide top-k tuning, read from the environment on first use.
pub fn topk_tuning() -> &'static TopkTuning {
    TOPK_TUNING.get_or_init(TopkTuning::from_env)
}
