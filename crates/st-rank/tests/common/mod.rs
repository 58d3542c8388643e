// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

#![allow(dead_code)]

use rand::Rng;
use st_rank::{run_topk_typed, Device, DeviceCaps, Stream, TopkElement};

pub struct Harness {
    pub device: Device,
    pub stream: Stream,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_caps(DeviceCaps::default().with_memory(1 << 30))
    }

    pub fn with_caps(caps: DeviceCaps) -> Self {
        let device = Device::new(0, caps).expect("device");
        let stream = device.create_stream().expect("stream");
        Self { device, stream }
    }

    /// Uploads `input`, runs top-k, synchronises and returns `(values, indices)`.
    pub fn topk<T: TopkElement>(
        &self,
        input: &[T],
        n: usize,
        k: usize,
        batch: usize,
    ) -> (Vec<T>, Vec<u32>) {
        let dev_input = self.device.allocate::<T>(input.len()).expect("input");
        let values = self.device.allocate::<T>(k * batch).expect("values");
        let indices = self.device.allocate::<u32>(k * batch).expect("indices");
        self.stream.then_memcpy_h2d(&dev_input, input).expect("upload");
        run_topk_typed(&self.stream, &dev_input, n, &values, &indices, k, batch).expect("launch");
        self.stream.block_host_until_done().expect("sync");
        (
            self.stream.copy_to_host_blocking(&values).expect("values readback"),
            self.stream.copy_to_host_blocking(&indices).expect("indices readback"),
        )
    }
}

/// Stable descending order over the element key, truncated to `k`.
pub fn oracle_indices<T: TopkElement>(row: &[T], k: usize) -> Vec<u32> {
    let mut order: Vec<u32> = (0..row.len() as u32).collect();
    order.sort_by(|&a, &b| row[b as usize].order_key().cmp(&row[a as usize].order_key()));
    order.truncate(k);
    order
}

/// First `k` values of `row` sorted descending by a full sequential sort.
pub fn oracle_values(row: &[f32], k: usize) -> Vec<f32> {
    let mut sorted = row.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    sorted.truncate(k);
    sorted
}

pub fn uniform(rng: &mut impl Rng, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(lo..hi)).collect()
}

/// Checks every batch of a result against the oracles.
pub fn assert_exact(input: &[f32], n: usize, k: usize, values: &[f32], indices: &[u32]) {
    for (b, row) in input.chunks_exact(n).enumerate() {
        let got_values = &values[b * k..(b + 1) * k];
        let got_indices = &indices[b * k..(b + 1) * k];
        assert_eq!(
            got_values,
            oracle_values(row, k).as_slice(),
            "values of batch {b} (n={n}, k={k})"
        );
        assert_eq!(
            got_indices,
            oracle_indices(row, k).as_slice(),
            "indices of batch {b} (n={n}, k={k})"
        );
        for (value, &index) in got_values.iter().zip(got_indices) {
            assert_eq!(value.to_bits(), row[index as usize].to_bits());
        }
    }
}
