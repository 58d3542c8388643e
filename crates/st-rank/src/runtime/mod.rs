// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod conditional;
pub mod readback;
pub mod thunk;
pub mod while_loop;

pub use conditional::{BranchSelector, ConditionalConfig, ConditionalThunk, SelectorKind};
pub use readback::HostReadbackCache;
pub use thunk::{
    BufferAllocations, BufferSlice, CopyThunk, ExecuteParams, InitializeParams, Memset32Thunk,
    ResourceRequests, SequentialThunk, Thunk, ThunkKind, ThunkSequence, TopkThunk,
};
pub use while_loop::WhileThunk;
