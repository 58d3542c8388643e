// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Execution-graph nodes.
//!
//! A thunk is one node of a compiled program. Its lifecycle is:
//!   1. `prepare` once, to declare what it needs;
//!   2. `initialize` once per device it will run on;
//!   3. `execute_on_stream` any number of times.
//! Execution only enqueues work unless a node documents a blocking readback.

use std::fmt;

use tracing::trace;

use crate::device::Device;
use crate::dtype::PrimitiveType;
use crate::error::{Error, Result};
use crate::memory::DeviceMemoryBase;
use crate::ops::topk::{run_topk, TopkParams};
use crate::stream::Stream;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThunkKind {
    Topk,
    Sequential,
    Conditional,
    While,
    Memset32,
    Copy,
    Custom,
}

impl fmt::Display for ThunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThunkKind::Topk => "topk",
            ThunkKind::Sequential => "sequential",
            ThunkKind::Conditional => "conditional",
            ThunkKind::While => "while",
            ThunkKind::Memset32 => "memset32",
            ThunkKind::Copy => "copy",
            ThunkKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Logical region of a program buffer: `(allocation index, byte offset, byte size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub allocation: usize,
    pub offset: usize,
    pub size: usize,
}

impl BufferSlice {
    pub const fn new(allocation: usize, offset: usize, size: usize) -> Self {
        Self {
            allocation,
            offset,
            size,
        }
    }

    /// The whole of allocation `allocation`, `size` bytes long.
    pub const fn whole(allocation: usize, size: usize) -> Self {
        Self::new(allocation, 0, size)
    }
}

/// Device buffers backing a program's allocations for one execution.
#[derive(Clone, Debug, Default)]
pub struct BufferAllocations {
    buffers: Vec<DeviceMemoryBase>,
}

impl BufferAllocations {
    pub fn new(buffers: Vec<DeviceMemoryBase>) -> Self {
        Self { buffers }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Resolves `slice` to device memory.
    pub fn get_device_address(&self, slice: &BufferSlice) -> Result<DeviceMemoryBase> {
        let base = self.buffers.get(slice.allocation).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "buffer allocation {} not bound ({} available)",
                slice.allocation,
                self.buffers.len()
            ))
        })?;
        base.slice(slice.offset, slice.size)
    }
}

/// Resources a program asks for before it is initialised.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceRequests {
    host_readbacks: Vec<usize>,
}

impl ResourceRequests {
    /// Records a per-device host staging buffer of `bytes`.
    pub fn request_host_readback(&mut self, bytes: usize) {
        self.host_readbacks.push(bytes);
    }

    pub fn host_readbacks(&self) -> &[usize] {
        &self.host_readbacks
    }
}

pub struct InitializeParams<'a> {
    pub executor: &'a Device,
}

pub struct ExecuteParams<'a> {
    pub stream: &'a Stream,
    pub buffer_allocations: &'a BufferAllocations,
}

/// One node of an execution graph.
pub trait Thunk: Send + Sync {
    fn kind(&self) -> ThunkKind;

    /// Declares resources; called once before any initialisation.
    fn prepare(&mut self, requests: &mut ResourceRequests) -> Result<()> {
        let _ = requests;
        Ok(())
    }

    /// Per-device setup; may be called concurrently for different devices.
    fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        let _ = params;
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> Result<()>;
}

pub type ThunkSequence = Vec<Box<dyn Thunk>>;

/// Runs its children in order on the same stream.
pub struct SequentialThunk {
    thunks: ThunkSequence,
}

impl SequentialThunk {
    pub fn new(thunks: ThunkSequence) -> Self {
        Self { thunks }
    }

    pub fn thunks(&self) -> &[Box<dyn Thunk>] {
        &self.thunks
    }
}

impl Thunk for SequentialThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Sequential
    }

    fn prepare(&mut self, requests: &mut ResourceRequests) -> Result<()> {
        for thunk in self.thunks.iter_mut() {
            thunk.prepare(requests)?;
        }
        Ok(())
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        for thunk in &self.thunks {
            thunk.initialize(params)?;
        }
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> Result<()> {
        for thunk in &self.thunks {
            trace!(kind = %thunk.kind(), "execute");
            thunk.execute_on_stream(params)?;
        }
        Ok(())
    }
}

/// Batched top-k over program buffers.
#[derive(Clone, Debug)]
pub struct TopkThunk {
    params: TopkParams,
    input: BufferSlice,
    values: BufferSlice,
    indices: BufferSlice,
}

impl TopkThunk {
    pub fn new(
        element_type: PrimitiveType,
        n: usize,
        k: usize,
        batch_size: usize,
        input: BufferSlice,
        values: BufferSlice,
        indices: BufferSlice,
    ) -> Self {
        Self {
            params: TopkParams::new(n, k, batch_size, element_type),
            input,
            values,
            indices,
        }
    }

    pub fn params(&self) -> &TopkParams {
        &self.params
    }
}

impl Thunk for TopkThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Topk
    }

    fn prepare(&mut self, _requests: &mut ResourceRequests) -> Result<()> {
        self.params.validate()
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let buffers = params.buffer_allocations;
        run_topk(
            params.stream,
            self.params.element_type,
            &buffers.get_device_address(&self.input)?,
            self.params.n,
            &buffers.get_device_address(&self.values)?,
            &buffers.get_device_address(&self.indices)?,
            self.params.k,
            self.params.batch_size,
        )
    }
}

/// Fills a slice with a 32-bit pattern.
#[derive(Clone, Debug)]
pub struct Memset32Thunk {
    dest: BufferSlice,
    value: u32,
}

impl Memset32Thunk {
    pub fn new(dest: BufferSlice, value: u32) -> Self {
        Self { dest, value }
    }
}

impl Thunk for Memset32Thunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Memset32
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let dest = params.buffer_allocations.get_device_address(&self.dest)?;
        params.stream.then_memset32(&dest, self.value)
    }
}

/// Device-to-device copy between two slices.
#[derive(Clone, Debug)]
pub struct CopyThunk {
    source: BufferSlice,
    dest: BufferSlice,
}

impl CopyThunk {
    pub fn new(source: BufferSlice, dest: BufferSlice) -> Self {
        Self { source, dest }
    }
}

impl Thunk for CopyThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Copy
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let buffers = params.buffer_allocations;
        params.stream.then_memcpy_d2d(
            &buffers.get_device_address(&self.dest)?,
            &buffers.get_device_address(&self.source)?,
        )
    }
}
