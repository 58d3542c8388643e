// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Host entry for batched top-k.
//!
//! Typical flow:
//!   let plan = plan_topk(device.caps(), &tuning, params)?;
//!   run_topk(&stream, PrimitiveType::F32, input, n, values, indices, k, batch)?;
//!
//! `run_topk` validates, plans and enqueues; it never waits for the device.
//! Results are only meaningful after the stream has been synchronised.

use spiral_config::device::{topk_tuning, TopkTuning};
use tracing::debug;

use crate::backend::device_caps::{bit_floor, DeviceCaps};
use crate::backend::topk_kernel::{self, KernelVariant, MAX_SMALL_K};
use crate::dtype::{PrimitiveType, TopkElement};
use crate::error::{invalid, Error, Result};
use crate::memory::{with_kernel_regions, DeviceBuffer, DeviceMemoryBase};
use crate::stream::Stream;

/// Scratch bytes per candidate slot: order key plus index.
const CANDIDATE_BYTES: u32 = 8;
/// Lanes a block would like to keep resident at `k_padded == 16`.
const SIMULTANEOUS_LANES_AT_MAX_K: u32 = 512;

/// Shape of one top-k request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopkParams {
    pub n: usize,
    pub k: usize,
    pub batch_size: usize,
    pub element_type: PrimitiveType,
}

impl TopkParams {
    pub fn new(n: usize, k: usize, batch_size: usize, element_type: PrimitiveType) -> Self {
        Self {
            n,
            k,
            batch_size,
            element_type,
        }
    }

    /// Rejects every request no kernel can serve.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(invalid("k must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1"));
        }
        if self.k > self.n {
            return Err(Error::InvalidArgument(format!(
                "k ({}) must not exceed n ({})",
                self.k, self.n
            )));
        }
        if self.n >= u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "n ({}) does not fit a 32-bit index",
                self.n
            )));
        }
        if !self.element_type.supports_topk() {
            return Err(Error::InvalidArgument(format!(
                "top-k is not implemented for element type {}",
                self.element_type
            )));
        }
        self.input_len()?;
        self.output_len()?;
        Ok(())
    }

    pub fn input_len(&self) -> Result<usize> {
        self.n
            .checked_mul(self.batch_size)
            .ok_or_else(|| invalid("n * batch_size overflows"))
    }

    pub fn output_len(&self) -> Result<usize> {
        self.k
            .checked_mul(self.batch_size)
            .ok_or_else(|| invalid("k * batch_size overflows"))
    }
}

/// Grid and block geometry of one launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// One block per batch element.
    pub blocks: u32,
    pub threads_per_block: u32,
    /// Candidate scratch a block holds while merging.
    pub shared_mem_bytes: u32,
    /// Lanes scanned by one pool task.
    pub lanes_per_task: usize,
}

/// Resolved launch for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopkPlan {
    pub n: u32,
    pub k: u32,
    pub batch_size: u32,
    pub k_padded: u32,
    pub variant: KernelVariant,
    pub launch: LaunchConfig,
}

/// Picks the kernel variant and the number of lanes per block.
///
/// Lanes start from the occupancy target (`512 * 16 / k_padded`, capped by
/// the device limit) and are limited so every lane has at least `k_padded`
/// elements to scan. Small-k lanes are then halved until their candidate
/// scratch fits the block's shared memory.
pub fn plan_topk(caps: &DeviceCaps, tuning: &TopkTuning, params: TopkParams) -> Result<TopkPlan> {
    params.validate()?;
    let batch_size = u32::try_from(params.batch_size).map_err(|_| {
        Error::InvalidArgument(format!(
            "batch_size ({}) exceeds the grid limit",
            params.batch_size
        ))
    })?;
    let k = params.k as u32;
    let n = params.n as u32;

    let (variant, k_padded) = if k <= MAX_SMALL_K {
        let k_padded = k.next_power_of_two();
        (KernelVariant::SmallK { k_padded }, k_padded)
    } else {
        (KernelVariant::LargeK, k)
    };

    let target = (SIMULTANEOUS_LANES_AT_MAX_K * MAX_SMALL_K / k_padded)
        .clamp(1, caps.max_threads_per_block);
    let by_elements = bit_floor(((n / k_padded).max(1)) as usize) as u32;
    let mut threads = target.min(by_elements);
    if let Some(cap) = tuning.max_threads {
        threads = threads.min(cap.max(1));
    }

    // Small-k lane lists live in block scratch; large-k lanes buffer on the heap.
    let shared_mem_bytes = match variant {
        KernelVariant::SmallK { .. } => {
            let fitting = caps.lanes_fitting_scratch(k_padded.saturating_mul(CANDIDATE_BYTES));
            if fitting == 0 {
                return Err(Error::ResourceExhausted(format!(
                    "k_padded={k_padded} needs {} scratch bytes per lane, block has {}",
                    k_padded.saturating_mul(CANDIDATE_BYTES),
                    caps.shared_mem_per_block
                )));
            }
            while threads > fitting {
                threads /= 2;
            }
            threads.max(1) * k_padded * CANDIDATE_BYTES
        }
        KernelVariant::LargeK => 0,
    };
    let threads = threads.max(1);

    Ok(TopkPlan {
        n,
        k,
        batch_size,
        k_padded,
        variant,
        launch: LaunchConfig {
            blocks: batch_size,
            threads_per_block: threads,
            shared_mem_bytes,
            lanes_per_task: tuning.lanes_per_task.max(1),
        },
    })
}

fn check_region(
    stream: &Stream,
    region: &DeviceMemoryBase,
    role: &str,
    needed_bytes: usize,
) -> Result<DeviceMemoryBase> {
    if region.device_id() != stream.device_id() {
        return Err(Error::InvalidArgument(format!(
            "{role} lives on {} but the stream runs on {}",
            region.device_id(),
            stream.device_id()
        )));
    }
    if region.size() < needed_bytes {
        return Err(Error::InvalidArgument(format!(
            "{role} holds {} bytes, {needed_bytes} required",
            region.size()
        )));
    }
    region.slice(0, needed_bytes)
}

/// Enqueues a batched top-k over `input` onto `stream`.
///
/// `input` holds `batch_size` slices of `n` elements of `element_type`;
/// `output_values` / `output_indices` receive `k` values and `u32` indices
/// per batch, in descending order. Fails with `InvalidArgument` or
/// `ResourceExhausted` before anything is enqueued; execution faults surface
/// at the stream's next synchronisation.
#[allow(clippy::too_many_arguments)]
pub fn run_topk(
    stream: &Stream,
    element_type: PrimitiveType,
    input: &DeviceMemoryBase,
    n: usize,
    output_values: &DeviceMemoryBase,
    output_indices: &DeviceMemoryBase,
    k: usize,
    batch_size: usize,
) -> Result<()> {
    let params = TopkParams::new(n, k, batch_size, element_type);
    params.validate()?;

    let width = element_type.byte_width();
    let input = check_region(stream, input, "input", params.input_len()? * width)?;
    let values = check_region(stream, output_values, "output values", params.output_len()? * width)?;
    let indices = check_region(
        stream,
        output_indices,
        "output indices",
        params.output_len()? * std::mem::size_of::<u32>(),
    )?;
    if values.overlaps(&input) || indices.overlaps(&input) {
        return Err(invalid("outputs must not alias the input"));
    }
    if values.overlaps(&indices) {
        return Err(invalid("output values and indices must not overlap"));
    }

    let plan = plan_topk(stream.device().caps(), topk_tuning(), params)?;
    debug!(
        dtype = %element_type,
        n,
        k,
        batch_size,
        variant = ?plan.variant,
        threads = plan.launch.threads_per_block,
        shared_mem = plan.launch.shared_mem_bytes,
        "enqueue topk"
    );

    match element_type {
        PrimitiveType::F32 => enqueue::<f32>(stream, plan, input, values, indices),
        PrimitiveType::BF16 => enqueue::<half::bf16>(stream, plan, input, values, indices),
        other => Err(Error::InvalidArgument(format!(
            "top-k is not implemented for element type {other}"
        ))),
    }
}

fn enqueue<T: TopkElement>(
    stream: &Stream,
    plan: TopkPlan,
    input: DeviceMemoryBase,
    values: DeviceMemoryBase,
    indices: DeviceMemoryBase,
) -> Result<()> {
    stream.then_launch("topk", move |device| {
        with_kernel_regions(&input, &values, &indices, |regions| {
            topk_kernel::launch_topk::<T>(device.pool(), &plan, regions)
        })
    })
}

/// Typed front end over [`run_topk`].
pub fn run_topk_typed<T: TopkElement>(
    stream: &Stream,
    input: &DeviceBuffer<T>,
    n: usize,
    output_values: &DeviceBuffer<T>,
    output_indices: &DeviceBuffer<u32>,
    k: usize,
    batch_size: usize,
) -> Result<()> {
    run_topk(
        stream,
        T::TYPE,
        input.as_base(),
        n,
        output_values.as_base(),
        output_indices.as_base(),
        k,
        batch_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n: usize, k: usize) -> TopkParams {
        TopkParams::new(n, k, 4, PrimitiveType::F32)
    }

    #[test]
    fn small_k_rounds_up_to_a_power_of_two() {
        let caps = DeviceCaps::simulated();
        let plan = plan_topk(&caps, &TopkTuning::default(), params(1031, 12)).unwrap();
        assert_eq!(plan.variant, KernelVariant::SmallK { k_padded: 16 });
        // 512 lanes wanted, but only 1031 / 16 = 64 -> 64 lanes have work.
        assert_eq!(plan.launch.threads_per_block, 64);
        assert_eq!(plan.launch.blocks, 4);
        assert_eq!(plan.launch.shared_mem_bytes, 64 * 16 * 8);
    }

    #[test]
    fn lanes_are_capped_by_the_device() {
        let caps = DeviceCaps::simulated().with_max_threads(256);
        let plan = plan_topk(&caps, &TopkTuning::default(), params(1 << 20, 1)).unwrap();
        assert_eq!(plan.launch.threads_per_block, 256);

        let tuning = TopkTuning {
            max_threads: Some(100),
            lanes_per_task: 8,
        };
        let plan = plan_topk(&DeviceCaps::simulated(), &tuning, params(1 << 20, 1)).unwrap();
        assert_eq!(plan.launch.threads_per_block, 100);
        assert_eq!(plan.launch.lanes_per_task, 8);
    }

    #[test]
    fn scratch_budget_halves_lanes() {
        let caps = DeviceCaps::simulated().with_shared_mem(4 * 1024);
        let plan = plan_topk(&caps, &TopkTuning::default(), params(1 << 16, 16)).unwrap();
        // 4 KiB / (16 * 8 bytes) = 32 lanes.
        assert_eq!(plan.launch.threads_per_block, 32);
        assert!(plan.launch.shared_mem_bytes <= 4 * 1024);
    }

    #[test]
    fn scratch_that_fits_no_lane_is_exhausted() {
        let caps = DeviceCaps::simulated().with_shared_mem(64);
        let err = plan_topk(&caps, &TopkTuning::default(), params(1024, 16)).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn large_k_uses_buffered_lanes() {
        let plan = plan_topk(
            &DeviceCaps::simulated(),
            &TopkTuning::default(),
            params(4096, 100),
        )
        .unwrap();
        assert_eq!(plan.variant, KernelVariant::LargeK);
        assert_eq!(plan.k_padded, 100);
        assert!(plan.launch.threads_per_block >= 1);
        assert_eq!(plan.launch.shared_mem_bytes, 0);
    }

    #[test]
    fn large_k_is_not_bounded_by_block_scratch() {
        for n in [6145, 8199, 131_079] {
            let plan = plan_topk(&DeviceCaps::simulated(), &TopkTuning::default(), params(n, n))
                .unwrap();
            assert_eq!(plan.variant, KernelVariant::LargeK);
            assert_eq!(plan.launch.threads_per_block, 1);
        }
        let tight = DeviceCaps::simulated().with_shared_mem(64);
        assert!(plan_topk(&tight, &TopkTuning::default(), params(1024, 17)).is_ok());
    }

    #[test]
    fn tiny_inputs_still_get_one_lane() {
        let plan = plan_topk(&DeviceCaps::simulated(), &TopkTuning::default(), params(3, 3)).unwrap();
        assert_eq!(plan.launch.threads_per_block, 1);
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let ok = params(16, 4);
        assert!(ok.validate().is_ok());
        for bad in [
            TopkParams { k: 0, ..ok },
            TopkParams { k: 17, ..ok },
            TopkParams { batch_size: 0, ..ok },
            TopkParams { element_type: PrimitiveType::F64, ..ok },
            TopkParams { element_type: PrimitiveType::S32, ..ok },
        ] {
            assert!(
                matches!(bad.validate(), Err(Error::InvalidArgument(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
