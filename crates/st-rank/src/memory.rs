// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Device and host memory handles.
//!
//! Device allocations are word-aligned byte regions owned by the device that
//! created them. Handles (`DeviceMemoryBase`, `DeviceBuffer<T>`) are cheap
//! clones of an `Arc`; the bytes are released back to the device ledger when
//! the last handle drops. The host never touches device bytes directly: all
//! transfers go through a stream, and kernels get bounds-checked views.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytemuck::Pod;

use crate::device::DeviceId;
use crate::error::{fault, internal, invalid, Error, Result};

static NEXT_ALLOCATION: AtomicU64 = AtomicU64::new(1);

/// Byte accounting for one device.
#[derive(Debug)]
pub(crate) struct MemoryLedger {
    capacity: u64,
    in_use: AtomicU64,
}

impl MemoryLedger {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            in_use: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|&next| next <= self.capacity)
                .ok_or_else(|| {
                    Error::ResourceExhausted(format!(
                        "device allocation of {bytes} bytes exceeds capacity ({current} of {} in use)",
                        self.capacity
                    ))
                })?;
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }
}

struct Allocation {
    id: u64,
    device: DeviceId,
    bytes: usize,
    words: RwLock<Vec<u64>>,
    ledger: Arc<MemoryLedger>,
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.ledger.release(self.bytes as u64);
    }
}

fn as_bytes(words: &[u64], len: usize) -> &[u8] {
    &bytemuck::cast_slice::<u64, u8>(words)[..len]
}

fn as_bytes_mut(words: &mut [u64], len: usize) -> &mut [u8] {
    &mut bytemuck::cast_slice_mut::<u64, u8>(words)[..len]
}

/// Untyped view of a device region: `(allocation, byte offset, byte size)`.
#[derive(Clone, Debug)]
pub struct DeviceMemoryBase {
    allocation: Arc<Allocation>,
    offset: usize,
    size: usize,
}

impl DeviceMemoryBase {
    pub(crate) fn allocate(device: DeviceId, bytes: usize, ledger: &Arc<MemoryLedger>) -> Result<Self> {
        ledger.reserve(bytes as u64)?;
        let words = vec![0u64; bytes.div_ceil(8)];
        let allocation = Allocation {
            id: NEXT_ALLOCATION.fetch_add(1, Ordering::Relaxed),
            device,
            bytes,
            words: RwLock::new(words),
            ledger: Arc::clone(ledger),
        };
        Ok(Self {
            allocation: Arc::new(allocation),
            offset: 0,
            size: bytes,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Byte offset of this view inside its allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn device_id(&self) -> DeviceId {
        self.allocation.device
    }

    pub fn allocation_id(&self) -> u64 {
        self.allocation.id
    }

    /// Sub-region `[offset, offset + size)` relative to this view.
    pub fn slice(&self, offset: usize, size: usize) -> Result<Self> {
        offset
            .checked_add(size)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "slice [{offset}, +{size}) is outside a {}-byte region",
                    self.size
                ))
            })?;
        Ok(Self {
            allocation: Arc::clone(&self.allocation),
            offset: self.offset + offset,
            size,
        })
    }

    pub fn same_allocation(&self, other: &DeviceMemoryBase) -> bool {
        Arc::ptr_eq(&self.allocation, &other.allocation)
    }

    /// True when both views share at least one byte.
    pub fn overlaps(&self, other: &DeviceMemoryBase) -> bool {
        self.same_allocation(other)
            && self.size > 0
            && other.size > 0
            && self.offset < other.offset + other.size
            && other.offset < self.offset + self.size
    }

    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, Vec<u64>>> {
        self.allocation
            .words
            .read()
            .map_err(|_| fault("device allocation poisoned by an earlier fault"))
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, Vec<u64>>> {
        self.allocation
            .words
            .write()
            .map_err(|_| fault("device allocation poisoned by an earlier fault"))
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let guard = self.read_guard()?;
        let bytes = as_bytes(&guard, self.allocation.bytes);
        Ok(f(&bytes[self.range()]))
    }

    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut guard = self.write_guard()?;
        let bytes = as_bytes_mut(&mut guard, self.allocation.bytes);
        let range = self.range();
        Ok(f(&mut bytes[range]))
    }
}

/// Typed view over a device region holding `len` elements of `T`.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    base: DeviceMemoryBase,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> DeviceBuffer<T> {
    /// Typed view over `base`; its size and offset must be whole elements.
    pub fn from_base(base: DeviceMemoryBase) -> Result<Self> {
        let width = std::mem::size_of::<T>();
        if width == 0 || base.size() % width != 0 || base.offset() % width != 0 {
            return Err(Error::InvalidArgument(format!(
                "region of {} bytes at offset {} is not a whole number of {width}-byte elements",
                base.size(),
                base.offset()
            )));
        }
        Ok(Self {
            len: base.size() / width,
            base,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_base(&self) -> &DeviceMemoryBase {
        &self.base
    }

    pub fn into_base(self) -> DeviceMemoryBase {
        self.base
    }

    /// Elements `[offset, offset + len)` of this buffer.
    pub fn get_slice(&self, offset: usize, len: usize) -> Result<Self> {
        let width = std::mem::size_of::<T>();
        let base = self.base.slice(
            offset.checked_mul(width).ok_or_else(|| invalid("slice offset overflows"))?,
            len.checked_mul(width).ok_or_else(|| invalid("slice length overflows"))?,
        )?;
        Ok(Self {
            base,
            len,
            _marker: PhantomData,
        })
    }
}

/// Host-side staging memory written by device-to-host copies.
#[derive(Clone, Debug)]
pub struct HostAllocation {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostAllocation {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; size])),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.lock().map(|bytes| bytes.len()).unwrap_or(0)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.bytes
            .lock()
            .map(|bytes| bytes.clone())
            .map_err(|_| internal("host allocation poisoned"))
    }

    /// Decodes the whole allocation as a sequence of `T`.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        let width = std::mem::size_of::<T>();
        let bytes = self.read_bytes()?;
        if width == 0 || bytes.len() % width != 0 {
            return Err(Error::InvalidArgument(format!(
                "host allocation of {} bytes is not a whole number of {width}-byte elements",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(width)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    pub(crate) fn write_prefix(&self, src: &[u8]) -> Result<()> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| internal("host allocation poisoned"))?;
        let dst = bytes.get_mut(..src.len()).ok_or_else(|| {
            fault("device-to-host copy larger than the host allocation")
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Borrowed regions handed to a kernel body.
pub(crate) struct KernelRegions<'a> {
    pub input: &'a [u8],
    pub first: &'a mut [u8],
    pub second: &'a mut [u8],
}

enum Guard<'a> {
    Read(RwLockReadGuard<'a, Vec<u64>>),
    Write(RwLockWriteGuard<'a, Vec<u64>>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Input,
    First,
    Second,
}

/// Locks every allocation touched by `(input, first, second)` and hands the
/// kernel one read-only and two mutable byte views.
///
/// Allocations are locked in id order so two streams launching over shared
/// buffers cannot deadlock. Views that share an allocation are carved out of a
/// single write guard; overlapping views are a fault.
pub(crate) fn with_kernel_regions<R>(
    input: &DeviceMemoryBase,
    first: &DeviceMemoryBase,
    second: &DeviceMemoryBase,
    body: impl FnOnce(KernelRegions<'_>) -> Result<R>,
) -> Result<R> {
    let views = [(Role::Input, input), (Role::First, first), (Role::Second, second)];

    let mut owners: Vec<&DeviceMemoryBase> = Vec::with_capacity(3);
    for (_, view) in views {
        if !owners.iter().any(|owner| owner.same_allocation(view)) {
            owners.push(view);
        }
    }
    owners.sort_by_key(|owner| owner.allocation_id());

    let mut guards: Vec<(&DeviceMemoryBase, Guard<'_>)> = Vec::with_capacity(owners.len());
    for owner in owners {
        let writable = views
            .iter()
            .any(|(role, view)| *role != Role::Input && view.same_allocation(owner));
        let guard = if writable {
            Guard::Write(owner.write_guard()?)
        } else {
            Guard::Read(owner.read_guard()?)
        };
        guards.push((owner, guard));
    }

    let mut input_bytes: Option<&[u8]> = None;
    let mut first_bytes: Option<&mut [u8]> = None;
    let mut second_bytes: Option<&mut [u8]> = None;

    for (owner, guard) in guards.iter_mut() {
        let total = owner.allocation.bytes;
        let mut members: Vec<(Role, Range<usize>)> = views
            .iter()
            .filter(|(_, view)| view.same_allocation(owner))
            .map(|(role, view)| (*role, view.range()))
            .collect();
        members.sort_by_key(|(_, range)| range.start);
        if members.windows(2).any(|pair| pair[0].1.end > pair[1].1.start) {
            return Err(fault("kernel regions overlap"));
        }

        match guard {
            Guard::Read(words) => {
                let bytes = as_bytes(&words[..], total);
                for (_, range) in members {
                    input_bytes = Some(&bytes[range]);
                }
            }
            Guard::Write(words) => {
                let mut rest: &mut [u8] = as_bytes_mut(&mut words[..], total);
                let mut cursor = 0usize;
                for (role, range) in members {
                    let tail = std::mem::take(&mut rest);
                    let (_, tail) = tail.split_at_mut(range.start - cursor);
                    let (region, tail) = tail.split_at_mut(range.len());
                    rest = tail;
                    cursor = range.end;
                    match role {
                        Role::Input => input_bytes = Some(region),
                        Role::First => first_bytes = Some(region),
                        Role::Second => second_bytes = Some(region),
                    }
                }
            }
        }
    }

    match (input_bytes, first_bytes, second_bytes) {
        (Some(input), Some(first), Some(second)) => body(KernelRegions {
            input,
            first,
            second,
        }),
        _ => Err(internal("kernel region bookkeeping lost a view")),
    }
}

/// Reinterprets a kernel byte view as `[T]`; misaligned or ragged views are
/// device faults.
pub(crate) fn typed<T: Pod>(bytes: &[u8]) -> Result<&[T]> {
    bytemuck::try_cast_slice(bytes).map_err(|err| Error::ExecutionFault(format!("misaligned device access: {err}")))
}

pub(crate) fn typed_mut<T: Pod>(bytes: &mut [u8]) -> Result<&mut [T]> {
    bytemuck::try_cast_slice_mut(bytes)
        .map_err(|err| Error::ExecutionFault(format!("misaligned device access: {err}")))
}
