// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The simulated accelerator: a compute-unit pool, a memory ledger and the
//! streams that feed them.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

pub use crate::backend::device_caps::DeviceCaps;
use crate::error::{invalid, Error, Result};
use crate::memory::{DeviceBuffer, DeviceMemoryBase, HostAllocation, MemoryLedger};
use crate::stream::Stream;

static NEXT_DEVICE: AtomicU32 = AtomicU32::new(0);

/// Process-unique identity of a [`Device`] instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

struct DeviceInner {
    id: DeviceId,
    ordinal: u32,
    caps: DeviceCaps,
    pool: ThreadPool,
    ledger: Arc<MemoryLedger>,
}

/// Handle to one device. Clones share the same pool and memory.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("ordinal", &self.inner.ordinal)
            .field("caps", &self.inner.caps)
            .field("memory_in_use", &self.memory_in_use())
            .finish()
    }
}

impl Device {
    pub fn new(ordinal: u32, caps: DeviceCaps) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(caps.compute_units.max(1) as usize)
            .thread_name(move |unit| format!("st-device{ordinal}-cu{unit}"))
            .build()
            .map_err(|err| Error::Internal(format!("compute unit pool: {err}")))?;
        let id = DeviceId(NEXT_DEVICE.fetch_add(1, Ordering::Relaxed));
        debug!(%id, ordinal, ?caps, "device created");
        Ok(Self {
            inner: Arc::new(DeviceInner {
                id,
                ordinal,
                caps,
                pool,
                ledger: Arc::new(MemoryLedger::new(caps.memory_bytes)),
            }),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn ordinal(&self) -> u32 {
        self.inner.ordinal
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.inner.caps
    }

    pub fn memory_in_use(&self) -> u64 {
        self.inner.ledger.in_use()
    }

    pub fn memory_capacity(&self) -> u64 {
        self.inner.ledger.capacity()
    }

    /// Zero-initialised buffer of `len` elements.
    pub fn allocate<T: Pod>(&self, len: usize) -> Result<DeviceBuffer<T>> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::ResourceExhausted(format!("{len} elements overflow a device allocation")))?;
        let base = DeviceMemoryBase::allocate(self.inner.id, bytes, &self.inner.ledger)?;
        DeviceBuffer::from_base(base)
    }

    /// Untyped zero-initialised region.
    pub fn allocate_bytes(&self, bytes: usize) -> Result<DeviceMemoryBase> {
        DeviceMemoryBase::allocate(self.inner.id, bytes, &self.inner.ledger)
    }

    /// Host staging memory for device-to-host copies.
    pub fn allocate_host(&self, bytes: usize) -> Result<HostAllocation> {
        if bytes == 0 {
            return Err(invalid("host allocation must be non-empty"));
        }
        Ok(HostAllocation::new(bytes))
    }

    pub fn create_stream(&self) -> Result<Stream> {
        Stream::new(self.clone())
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }
}
