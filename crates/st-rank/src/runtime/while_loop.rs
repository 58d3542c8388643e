// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use tracing::{debug, trace};

use crate::error::{internal, Error, Result};
use crate::runtime::readback::HostReadbackCache;
use crate::runtime::thunk::{
    BufferSlice, ExecuteParams, InitializeParams, ResourceRequests, SequentialThunk, Thunk,
    ThunkKind, ThunkSequence,
};

/// Loop node: runs the condition sequence, reads its one-byte predicate back
/// and runs the body while it is true. With a known trip count the condition
/// is never evaluated and nothing blocks the host.
pub struct WhileThunk {
    condition_result: BufferSlice,
    condition: SequentialThunk,
    body: SequentialThunk,
    trip_count: Option<u64>,
    readback: HostReadbackCache,
}

impl WhileThunk {
    pub fn new(
        condition_result: BufferSlice,
        condition: ThunkSequence,
        body: ThunkSequence,
        trip_count: Option<u64>,
    ) -> Self {
        Self {
            condition_result,
            condition: SequentialThunk::new(condition),
            body: SequentialThunk::new(body),
            trip_count,
            readback: HostReadbackCache::new(1),
        }
    }

    pub fn condition(&self) -> &SequentialThunk {
        &self.condition
    }

    pub fn body(&self) -> &SequentialThunk {
        &self.body
    }

    pub fn trip_count(&self) -> Option<u64> {
        self.trip_count
    }

    fn read_predicate(&self, params: &ExecuteParams<'_>) -> Result<bool> {
        let stream = params.stream;
        let host = self.readback.get(stream.device_id())?;
        let region = params
            .buffer_allocations
            .get_device_address(&self.condition_result)?
            .slice(0, 1)?;
        stream.then_memcpy_d2h(&host, &region)?;
        stream.block_host_until_done().map_err(|err| {
            Error::ExecutionFault(format!(
                "failed to retrieve loop predicate on {:?}: {}",
                stream,
                err.message()
            ))
        })?;
        host.read_bytes()?
            .first()
            .map(|&byte| byte != 0)
            .ok_or_else(|| internal("empty loop predicate readback"))
    }
}

impl Thunk for WhileThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::While
    }

    fn prepare(&mut self, requests: &mut ResourceRequests) -> Result<()> {
        self.condition.prepare(requests)?;
        self.body.prepare(requests)?;
        if self.trip_count.is_none() {
            requests.request_host_readback(self.readback.bytes());
        }
        Ok(())
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        self.condition.initialize(params)?;
        self.body.initialize(params)?;
        if self.trip_count.is_none() {
            self.readback.ensure(params.executor)?;
        }
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> Result<()> {
        if let Some(trip_count) = self.trip_count {
            debug!(trip_count, "while loop with known trip count");
            for iteration in 0..trip_count {
                trace!(iteration, "while body");
                self.body.execute_on_stream(params)?;
            }
            return Ok(());
        }

        let mut iteration = 0u64;
        loop {
            self.condition.execute_on_stream(params)?;
            if !self.read_predicate(params)? {
                break;
            }
            trace!(iteration, "while body");
            self.body.execute_on_stream(params)?;
            iteration += 1;
        }
        debug!(iterations = iteration, "while loop finished");
        Ok(())
    }
}
