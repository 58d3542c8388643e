// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)

//! Small-k top-k benchmark harness.
//!
//! Each case uploads one random row of `n` elements into every batch slot,
//! then times repeated launches between two stream events.

use rand::Rng;
use serde::Serialize;
use spiral_config::determinism::rng_from_label;
use st_rank::{run_topk_typed, Device, DeviceBuffer, Error, EventTimer, Result, Stream};
use std::time::Duration;
use tracing::{debug, warn};

/// k values covered by the small-k variant.
pub const SMALL_KS: [usize; 5] = [1, 2, 4, 8, 16];

/// Geometric step between consecutive batch sizes and row lengths.
pub const RANGE_MULTIPLIER: usize = 8;

/// Values from `lo` to `hi` inclusive: `lo`, every power of `multiplier`
/// strictly between the two, then `hi`.
pub fn range_with_multiplier(lo: usize, hi: usize, multiplier: usize) -> Vec<usize> {
    let multiplier = multiplier.max(2);
    let mut values = vec![lo];
    let mut step = 1usize;
    while step < hi {
        if step > lo {
            values.push(step);
        }
        step = step.saturating_mul(multiplier);
    }
    if hi > lo {
        values.push(hi);
    }
    values
}

/// How much of the sweep to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SweepScope {
    /// Batch sizes up to 64 and rows up to 64Ki elements.
    Quick,
    /// Batch sizes 1..=1024 crossed with rows of 16Ki..=1024Ki elements.
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SmallTopkCase {
    pub k: usize,
    pub batch_size: usize,
    pub n: usize,
}

impl SmallTopkCase {
    pub fn new(k: usize, batch_size: usize, n: usize) -> Self {
        Self { k, batch_size, n }
    }

    pub fn label(&self) -> String {
        format!("n={}Ki k={} batch_size={}", self.n / 1024, self.k, self.batch_size)
    }

    /// Elements read by one launch.
    pub fn items(&self) -> u64 {
        (self.n as u64) * (self.batch_size as u64)
    }

    pub fn bytes(&self) -> u64 {
        self.items() * std::mem::size_of::<f32>() as u64
    }
}

/// Cross product of [`SMALL_KS`], batch sizes and row lengths for `scope`.
pub fn small_topk_cases(scope: SweepScope) -> Vec<SmallTopkCase> {
    let (batch_hi, n_kib_hi) = match scope {
        SweepScope::Quick => (64, 64),
        SweepScope::Full => (1024, 1024),
    };
    let batches = range_with_multiplier(1, batch_hi, RANGE_MULTIPLIER);
    let rows = range_with_multiplier(16, n_kib_hi, RANGE_MULTIPLIER);
    let mut cases = Vec::with_capacity(SMALL_KS.len() * batches.len() * rows.len());
    for k in SMALL_KS {
        for &batch_size in &batches {
            for &n_kib in &rows {
                cases.push(SmallTopkCase::new(k, batch_size, n_kib * 1024));
            }
        }
    }
    cases
}

/// Device buffers for one case, with the input already resident.
pub struct SmallTopkFixture {
    case: SmallTopkCase,
    stream: Stream,
    input: DeviceBuffer<f32>,
    values: DeviceBuffer<f32>,
    indices: DeviceBuffer<u32>,
}

impl SmallTopkFixture {
    pub fn new(device: &Device, case: SmallTopkCase) -> Result<Self> {
        let stream = device.create_stream()?;
        let input = device.allocate::<f32>(case.n * case.batch_size)?;
        let values = device.allocate::<f32>(case.k * case.batch_size)?;
        let indices = device.allocate::<u32>(case.k * case.batch_size)?;

        let mut rng = rng_from_label(&case.label());
        let row: Vec<f32> = (0..case.n)
            .map(|_| rng.gen_range(0.0..case.n as f32))
            .collect();
        // one source row for every batch; generating batch_size rows dominates setup
        let depth = device.caps().stream_queue_depth.max(1) as usize;
        for b in 0..case.batch_size {
            let slot = input.get_slice(b * case.n, case.n)?;
            stream.then_memcpy_h2d(&slot, &row)?;
            if (b + 1) % depth == 0 {
                stream.block_host_until_done()?;
            }
        }
        stream.block_host_until_done()?;

        Ok(Self {
            case,
            stream,
            input,
            values,
            indices,
        })
    }

    pub fn case(&self) -> SmallTopkCase {
        self.case
    }

    /// One timed launch; the duration spans the kernel only.
    pub fn run_once(&self) -> Result<Duration> {
        let case = self.case;
        let mut timer = EventTimer::start(&self.stream)?;
        run_topk_typed(
            &self.stream,
            &self.input,
            case.n,
            &self.values,
            &self.indices,
            case.k,
            case.batch_size,
        )?;
        timer.stop(&self.stream)?;
        self.stream.block_host_until_done()?;
        timer.elapsed()
    }

    /// Total event time of `iterations` launches; the first failure aborts.
    pub fn time_launches(&self, iterations: u64) -> Result<Duration> {
        let mut total = Duration::ZERO;
        for _ in 0..iterations {
            total += self.run_once()?;
        }
        Ok(total)
    }

    pub fn outputs(&self) -> Result<(Vec<f32>, Vec<u32>)> {
        Ok((
            self.stream.copy_to_host_blocking(&self.values)?,
            self.stream.copy_to_host_blocking(&self.indices)?,
        ))
    }
}

mod model {
    use super::*;
    use std::fmt::Write as _;

    /// Timings collected for one case.
    #[derive(Clone, Debug, PartialEq, Serialize)]
    pub struct BenchSample {
        pub case: SmallTopkCase,
        pub iteration_secs: Vec<f64>,
    }

    /// A case that could not be set up, usually for lack of device memory.
    #[derive(Clone, Debug, PartialEq, Serialize)]
    pub struct SkippedCase {
        pub case: SmallTopkCase,
        pub reason: String,
    }

    #[derive(Clone, Debug, PartialEq, Serialize)]
    pub struct BenchStats {
        pub label: String,
        pub k: usize,
        pub batch_size: usize,
        pub n: usize,
        pub iterations: usize,
        pub elapsed_secs: f64,
        pub mean_ms: f64,
        pub std_ms: f64,
        pub p95_ms: f64,
        pub items_per_sec: f64,
        pub bytes_per_sec: f64,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    pub struct BenchReport {
        pub samples: Vec<BenchSample>,
        pub skipped: Vec<SkippedCase>,
    }

    impl BenchSample {
        pub fn stats(&self) -> BenchStats {
            let iterations = self.iteration_secs.len();
            let count = iterations.max(1) as f64;
            let elapsed_secs: f64 = self.iteration_secs.iter().sum();
            let mean = elapsed_secs / count;
            let variance = self
                .iteration_secs
                .iter()
                .map(|s| {
                    let diff = s - mean;
                    diff * diff
                })
                .sum::<f64>()
                / count;

            let mut sorted = self.iteration_secs.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
            let p95 = sorted.get(idx).copied().unwrap_or(mean);

            let items = self.case.items() as f64 * iterations as f64;
            let bytes = self.case.bytes() as f64 * iterations as f64;
            let rate = |total: f64| {
                if elapsed_secs > 0.0 {
                    total / elapsed_secs
                } else {
                    0.0
                }
            };

            BenchStats {
                label: self.case.label(),
                k: self.case.k,
                batch_size: self.case.batch_size,
                n: self.case.n,
                iterations,
                elapsed_secs,
                mean_ms: mean * 1e3,
                std_ms: variance.max(0.0).sqrt() * 1e3,
                p95_ms: p95 * 1e3,
                items_per_sec: rate(items),
                bytes_per_sec: rate(bytes),
            }
        }
    }

    impl BenchReport {
        /// Per-case statistics ordered by `(k, batch_size, n)`.
        pub fn summaries(&self) -> Vec<BenchStats> {
            let mut stats: Vec<BenchStats> = self.samples.iter().map(BenchSample::stats).collect();
            stats.sort_by_key(|s| (s.k, s.batch_size, s.n));
            stats
        }

        pub fn to_json(&self) -> serde_json::Result<String> {
            #[derive(Serialize)]
            struct Document<'a> {
                summaries: Vec<BenchStats>,
                skipped: &'a [SkippedCase],
            }
            serde_json::to_string_pretty(&Document {
                summaries: self.summaries(),
                skipped: &self.skipped,
            })
        }

        pub fn render_table(&self) -> String {
            let mut out = String::new();
            let _ = writeln!(
                out,
                "{:<32} {:>6} {:>10} {:>10} {:>10} {:>14} {:>12}",
                "case", "iters", "mean ms", "std ms", "p95 ms", "items/s", "GB/s"
            );
            for s in self.summaries() {
                let _ = writeln!(
                    out,
                    "{:<32} {:>6} {:>10.4} {:>10.4} {:>10.4} {:>14.3e} {:>12.3}",
                    s.label,
                    s.iterations,
                    s.mean_ms,
                    s.std_ms,
                    s.p95_ms,
                    s.items_per_sec,
                    s.bytes_per_sec / 1e9
                );
            }
            for skipped in &self.skipped {
                let _ = writeln!(out, "{:<32} skipped: {}", skipped.case.label(), skipped.reason);
            }
            out
        }
    }
}

pub use model::{BenchReport, BenchSample, BenchStats, SkippedCase};

/// Times `iterations` launches per case. Cases that cannot be allocated are
/// recorded as skipped; any other failure aborts the sweep.
pub fn run_sweep(device: &Device, cases: &[SmallTopkCase], iterations: usize) -> Result<BenchReport> {
    let mut report = BenchReport::default();
    for &case in cases {
        let fixture = match SmallTopkFixture::new(device, case) {
            Ok(fixture) => fixture,
            Err(Error::ResourceExhausted(reason)) => {
                warn!(case = %case.label(), %reason, "unable to allocate device memory; skipping");
                report.skipped.push(SkippedCase { case, reason });
                continue;
            }
            Err(err) => return Err(err),
        };
        // warm-up launch, untimed
        fixture.run_once()?;
        let mut iteration_secs = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            iteration_secs.push(fixture.run_once()?.as_secs_f64());
        }
        debug!(case = %case.label(), iterations, "case complete");
        report.samples.push(BenchSample {
            case,
            iteration_secs,
        });
    }
    Ok(report)
}
