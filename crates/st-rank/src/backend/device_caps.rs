// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fmt;

use spiral_config::device::DeviceConfig;

/// Capability description consumed by the launch planner.
///
/// Only the knobs that change a launch decision live here: how many lanes a
/// block may have, how much scratch each block gets, and how much work the
/// device and its streams can hold.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Native lane width for warp-style execution.
    pub lane_width: u32,
    /// Maximum threads per block.
    pub max_threads_per_block: u32,
    /// Scratch memory available per block (bytes).
    pub shared_mem_per_block: u32,
    /// Compute units (pool workers) executing blocks concurrently.
    pub compute_units: u32,
    /// Device memory capacity (bytes).
    pub memory_bytes: u64,
    /// Operations a stream may hold before enqueue reports exhaustion.
    pub stream_queue_depth: u32,
}

impl fmt::Debug for DeviceCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCaps")
            .field("lane_width", &self.lane_width)
            .field("max_threads_per_block", &self.max_threads_per_block)
            .field("shared_mem_per_block", &self.shared_mem_per_block)
            .field("compute_units", &self.compute_units)
            .field("memory_bytes", &self.memory_bytes)
            .field("stream_queue_depth", &self.stream_queue_depth)
            .finish()
    }
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

impl DeviceCaps {
    /// Small fixed-shape device, independent of the host and the environment.
    /// Intended for tests that need reproducible launch plans.
    pub fn simulated() -> Self {
        Self {
            lane_width: 32,
            max_threads_per_block: 1024,
            shared_mem_per_block: 48 * 1024,
            compute_units: 4,
            memory_bytes: 1 << 30,
            stream_queue_depth: 256,
        }
    }

    pub fn from_config(cfg: &DeviceConfig) -> Self {
        Self {
            lane_width: 32,
            max_threads_per_block: cfg.max_threads_per_block.max(1),
            shared_mem_per_block: cfg.shared_mem_per_block,
            compute_units: u32::try_from(cfg.compute_units).unwrap_or(u32::MAX).max(1),
            memory_bytes: cfg.memory_bytes,
            stream_queue_depth: u32::try_from(cfg.stream_queue_depth)
                .unwrap_or(u32::MAX)
                .max(1),
        }
    }

    /// Builder style helper to override the per-block thread limit.
    pub fn with_max_threads(mut self, max_threads: u32) -> Self {
        self.max_threads_per_block = max_threads.max(1);
        self
    }

    /// Builder style helper to override the scratch budget.
    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_per_block = bytes;
        self
    }

    pub fn with_compute_units(mut self, units: u32) -> Self {
        self.compute_units = units.max(1);
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.stream_queue_depth = depth.max(1);
        self
    }

    /// Lanes whose scratch of `bytes_per_lane` fits in one block.
    pub fn lanes_fitting_scratch(&self, bytes_per_lane: u32) -> u32 {
        if bytes_per_lane == 0 {
            return self.max_threads_per_block;
        }
        (self.shared_mem_per_block / bytes_per_lane).min(self.max_threads_per_block)
    }
}

#[inline]
pub(crate) fn bit_floor(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - value.leading_zeros())
    }
}
