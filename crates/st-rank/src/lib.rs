// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Batched top-k selection on a stream-ordered accelerator.
//!
//! Typical flow:
//!   let device = platform::executor_for_device(0)?;
//!   let stream = device.create_stream()?;
//!   stream.then_memcpy_h2d(&input, &host)?;
//!   run_topk_typed(&stream, &input, n, &values, &indices, k, batch)?;
//!   stream.block_host_until_done()?;

pub mod backend;
pub mod device;
pub mod dtype;
pub mod error;
pub mod memory;
pub mod ops;
pub mod platform;
pub mod runtime;
pub mod stream;
pub mod telemetry;

pub use device::{Device, DeviceCaps, DeviceId};
pub use dtype::{PrimitiveType, TopkElement};
pub use error::{Error, Result, StatusCode};
pub use memory::{DeviceBuffer, DeviceMemoryBase, HostAllocation};
pub use ops::topk::{plan_topk, run_topk, run_topk_typed, LaunchConfig, TopkParams, TopkPlan};
pub use stream::{Event, EventTimer, Stream};
