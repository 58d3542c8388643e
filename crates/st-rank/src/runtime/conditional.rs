// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Run-time branch selection.
//!
//! The selector scalar lives on the device. Executing the node copies it into
//! a per-device host buffer, waits for that copy (the node's one blocking
//! point), and then enqueues exactly one branch.

use tracing::debug;

use crate::error::{internal, Error, Result};
use crate::runtime::readback::HostReadbackCache;
use crate::runtime::thunk::{
    BufferSlice, ExecuteParams, InitializeParams, ResourceRequests, Thunk, ThunkKind,
};

/// Selector value as read back from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchSelector {
    Index(i32),
    Pred(bool),
}

impl BranchSelector {
    /// Branch to run among `branch_count`. `true` selects branch 0 and
    /// `false` branch 1; indices outside `[0, branch_count)` select the last
    /// branch.
    pub fn resolve(self, branch_count: usize) -> usize {
        let index = match self {
            BranchSelector::Index(index) => index,
            BranchSelector::Pred(true) => 0,
            BranchSelector::Pred(false) => 1,
        };
        match usize::try_from(index) {
            Ok(index) if index < branch_count => index,
            _ => branch_count.saturating_sub(1),
        }
    }
}

/// Selector encoding of a conditional.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorKind {
    /// One-byte boolean, exactly two branches.
    Pred,
    /// Native-endian `i32`, at least one branch.
    Index,
}

impl SelectorKind {
    pub const fn byte_width(self) -> usize {
        match self {
            SelectorKind::Pred => 1,
            SelectorKind::Index => 4,
        }
    }

    fn decode(self, bytes: &[u8]) -> Result<BranchSelector> {
        match self {
            SelectorKind::Pred => bytes
                .first()
                .map(|&byte| BranchSelector::Pred(byte != 0))
                .ok_or_else(|| internal("empty predicate readback")),
            SelectorKind::Index => bytes
                .get(..4)
                .and_then(|word| <[u8; 4]>::try_from(word).ok())
                .map(|word| BranchSelector::Index(i32::from_ne_bytes(word)))
                .ok_or_else(|| internal("short branch index readback")),
        }
    }
}

pub struct ConditionalConfig {
    pub selector: SelectorKind,
    pub branch_thunks: Vec<Box<dyn Thunk>>,
}

pub struct ConditionalThunk {
    config: ConditionalConfig,
    branch_index_buffer: BufferSlice,
    readback: HostReadbackCache,
}

impl ConditionalThunk {
    pub fn new(config: ConditionalConfig, branch_index_buffer: BufferSlice) -> Self {
        let readback = HostReadbackCache::new(config.selector.byte_width());
        Self {
            config,
            branch_index_buffer,
            readback,
        }
    }

    pub fn branch_count(&self) -> usize {
        self.config.branch_thunks.len()
    }

    /// Devices this node holds a readback buffer for.
    pub fn readback_buffers(&self) -> usize {
        self.readback.len()
    }

    fn check_branch_count(&self) -> Result<()> {
        let count = self.branch_count();
        match self.config.selector {
            SelectorKind::Pred if count != 2 => Err(Error::Internal(format!(
                "predicated conditional needs exactly 2 branches, has {count}"
            ))),
            SelectorKind::Index if count == 0 => {
                Err(internal("indexed conditional needs at least one branch"))
            }
            _ => Ok(()),
        }
    }
}

impl Thunk for ConditionalThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Conditional
    }

    fn prepare(&mut self, requests: &mut ResourceRequests) -> Result<()> {
        self.check_branch_count()?;
        for branch in self.config.branch_thunks.iter_mut() {
            branch.prepare(requests)?;
        }
        requests.request_host_readback(self.readback.bytes());
        Ok(())
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        self.check_branch_count()?;
        for branch in &self.config.branch_thunks {
            branch.initialize(params)?;
        }
        self.readback.ensure(params.executor)
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let stream = params.stream;
        let host = self.readback.get(stream.device_id())?;
        let width = self.config.selector.byte_width();
        let selector_region = params
            .buffer_allocations
            .get_device_address(&self.branch_index_buffer)?
            .slice(0, width)?;

        stream.then_memcpy_d2h(&host, &selector_region)?;
        stream.block_host_until_done().map_err(|err| {
            Error::ExecutionFault(format!(
                "failed to retrieve branch selector on {:?}: {}",
                stream,
                err.message()
            ))
        })?;

        let selector = self.config.selector.decode(&host.read_bytes()?)?;
        let branch = selector.resolve(self.branch_count());
        debug!(?selector, branch, branches = self.branch_count(), "conditional dispatch");
        self.config
            .branch_thunks
            .get(branch)
            .ok_or_else(|| internal("branch index resolved past the branch list"))?
            .execute_on_stream(params)
    }
}
