// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Block-parallel top-k selection.
//!
//! Each batch element is one block. A block's lanes scan disjoint contiguous
//! ranges of the `n` inputs and keep a sorted candidate list each; the lists
//! are then merged pairwise, round after round, until one remains. Candidates
//! carry the element's order key and index only: the value written out is
//! re-read from the input at the winning index, so value and index can never
//! disagree.

use std::cmp::Ordering;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::trace;

use crate::dtype::TopkElement;
use crate::error::{Error, Result};
use crate::memory::{typed, typed_mut, KernelRegions};
use crate::ops::topk::TopkPlan;

/// Per-lane storage strategy chosen by the planner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelVariant {
    /// Fixed-capacity lane lists of `k_padded` slots (a power of two ≤ 16).
    SmallK { k_padded: u32 },
    /// Buffered partial selection for larger `k`.
    LargeK,
}

/// Largest `k` served by the fixed-capacity lane lists.
pub const MAX_SMALL_K: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    key: u32,
    index: u32,
}

/// Sentinel slot. Its index sorts after every real index, so at equal keys a
/// real element (NaN included) always ranks first.
pub(crate) const PADDING: Candidate = Candidate {
    key: 0,
    index: u32::MAX,
};

impl Candidate {
    #[inline]
    fn is_padding(&self) -> bool {
        self.index == PADDING.index
    }
}

/// `Less` means `a` ranks ahead of `b`.
#[inline]
pub(crate) fn rank_cmp(a: &Candidate, b: &Candidate) -> Ordering {
    b.key.cmp(&a.key).then_with(|| a.index.cmp(&b.index))
}

trait LaneList: Send + Sized {
    fn empty(k: usize) -> Self;
    fn offer(&mut self, candidate: Candidate);
    fn merge(self, other: Self) -> Self;
    fn finish(self) -> Vec<Candidate>;
}

struct SmallLane<const K: usize> {
    slots: [Candidate; K],
}

impl<const K: usize> LaneList for SmallLane<K> {
    fn empty(_k: usize) -> Self {
        Self {
            slots: [PADDING; K],
        }
    }

    #[inline]
    fn offer(&mut self, candidate: Candidate) {
        if rank_cmp(&candidate, &self.slots[K - 1]) != Ordering::Less {
            return;
        }
        let mut pos = K - 1;
        while pos > 0 && rank_cmp(&candidate, &self.slots[pos - 1]) == Ordering::Less {
            self.slots[pos] = self.slots[pos - 1];
            pos -= 1;
        }
        self.slots[pos] = candidate;
    }

    fn merge(self, other: Self) -> Self {
        let mut slots = [PADDING; K];
        let (mut i, mut j) = (0, 0);
        for slot in slots.iter_mut() {
            if rank_cmp(&self.slots[i], &other.slots[j]) != Ordering::Greater {
                *slot = self.slots[i];
                i += 1;
            } else {
                *slot = other.slots[j];
                j += 1;
            }
        }
        Self { slots }
    }

    fn finish(self) -> Vec<Candidate> {
        self.slots.to_vec()
    }
}

struct LargeLane {
    k: usize,
    buffer: Vec<Candidate>,
}

impl LargeLane {
    fn compact(&mut self) {
        if self.buffer.len() > self.k {
            self.buffer.select_nth_unstable_by(self.k, rank_cmp);
            self.buffer.truncate(self.k);
        }
    }
}

impl LaneList for LargeLane {
    fn empty(k: usize) -> Self {
        Self {
            k,
            buffer: Vec::with_capacity(2 * k),
        }
    }

    #[inline]
    fn offer(&mut self, candidate: Candidate) {
        self.buffer.push(candidate);
        if self.buffer.len() >= 2 * self.k {
            self.compact();
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.buffer.extend(other.buffer);
        self.compact();
        self
    }

    fn finish(mut self) -> Vec<Candidate> {
        self.compact();
        self.buffer.sort_unstable_by(rank_cmp);
        self.buffer.resize(self.k, PADDING);
        self.buffer
    }
}

/// Geometry shared by every block of one launch.
#[derive(Clone, Copy, Debug)]
struct BlockShape {
    n: usize,
    k: usize,
    threads: usize,
    lanes_per_task: usize,
}

impl BlockShape {
    fn chunk(&self) -> usize {
        self.n.div_ceil(self.threads)
    }
}

fn scan_lane<T: TopkElement, L: LaneList>(row: &[T], shape: BlockShape, lane: usize) -> L {
    let mut list = L::empty(shape.k);
    let chunk = shape.chunk();
    let start = (lane * chunk).min(row.len());
    let end = (start + chunk).min(row.len());
    for (offset, &value) in row[start..end].iter().enumerate() {
        list.offer(Candidate {
            key: value.order_key(),
            index: (start + offset) as u32,
        });
    }
    list
}

fn tournament<L: LaneList>(mut round: Vec<L>) -> Option<L> {
    while round.len() > 1 {
        let mut next = Vec::with_capacity(round.len().div_ceil(2));
        let mut lists = round.into_iter();
        while let Some(left) = lists.next() {
            next.push(match lists.next() {
                Some(right) => left.merge(right),
                None => left,
            });
        }
        round = next;
    }
    round.pop()
}

fn select_block<T: TopkElement, L: LaneList>(
    block: usize,
    row: &[T],
    values: &mut [T],
    indices: &mut [u32],
    shape: BlockShape,
) -> Result<()> {
    let lanes: Vec<L> = (0..shape.threads)
        .into_par_iter()
        .with_min_len(shape.lanes_per_task)
        .map(|lane| scan_lane::<T, L>(row, shape, lane))
        .collect();
    let winners = tournament(lanes)
        .ok_or_else(|| Error::ExecutionFault(format!("block {block} launched without lanes")))?
        .finish();

    for (slot, winner) in winners.iter().take(shape.k).enumerate() {
        if winner.is_padding() {
            return Err(Error::ExecutionFault(format!(
                "block {block}: padding reached output slot {slot}"
            )));
        }
        let index = winner.index as usize;
        let value = row.get(index).copied().ok_or_else(|| {
            Error::ExecutionFault(format!("block {block}: candidate index {index} out of range"))
        })?;
        values[slot] = value;
        indices[slot] = winner.index;
    }
    Ok(())
}

fn run_blocks<T: TopkElement, L: LaneList>(
    input: &[T],
    values: &mut [T],
    indices: &mut [u32],
    shape: BlockShape,
) -> Result<()> {
    input
        .par_chunks_exact(shape.n)
        .zip(values.par_chunks_exact_mut(shape.k))
        .zip(indices.par_chunks_exact_mut(shape.k))
        .enumerate()
        .try_for_each(|(block, ((row, values), indices))| {
            select_block::<T, L>(block, row, values, indices, shape)
        })
}

/// Executes `plan` over the kernel views on the device's compute units.
pub(crate) fn launch_topk<T: TopkElement>(
    pool: &ThreadPool,
    plan: &TopkPlan,
    regions: KernelRegions<'_>,
) -> Result<()> {
    let input = typed::<T>(regions.input)?;
    let values = typed_mut::<T>(regions.first)?;
    let indices = typed_mut::<u32>(regions.second)?;

    let n = plan.n as usize;
    let k = plan.k as usize;
    let batch = plan.batch_size as usize;
    if input.len() != n * batch || values.len() != k * batch || indices.len() != k * batch {
        return Err(Error::ExecutionFault(format!(
            "kernel views ({} / {} / {}) do not match n={n} k={k} batch={batch}",
            input.len(),
            values.len(),
            indices.len()
        )));
    }

    let shape = BlockShape {
        n,
        k,
        threads: plan.launch.threads_per_block.max(1) as usize,
        lanes_per_task: plan.launch.lanes_per_task.max(1),
    };
    trace!(variant = ?plan.variant, ?shape, blocks = batch, "topk blocks");

    pool.install(|| match plan.variant {
        KernelVariant::SmallK { k_padded: 1 } => run_blocks::<T, SmallLane<1>>(input, values, indices, shape),
        KernelVariant::SmallK { k_padded: 2 } => run_blocks::<T, SmallLane<2>>(input, values, indices, shape),
        KernelVariant::SmallK { k_padded: 4 } => run_blocks::<T, SmallLane<4>>(input, values, indices, shape),
        KernelVariant::SmallK { k_padded: 8 } => run_blocks::<T, SmallLane<8>>(input, values, indices, shape),
        KernelVariant::SmallK { k_padded: 16 } => run_blocks::<T, SmallLane<16>>(input, values, indices, shape),
        KernelVariant::SmallK { k_padded } => Err(Error::ExecutionFault(format!(
            "no small-k instantiation for k_padded={k_padded}"
        ))),
        KernelVariant::LargeK => run_blocks::<T, LargeLane>(input, values, indices, shape),
    })
}
