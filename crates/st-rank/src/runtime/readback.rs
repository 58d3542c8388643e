// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::device::{Device, DeviceId};
use crate::error::{internal, Error, Result};
use crate::memory::HostAllocation;

/// One host staging buffer per device, allocated on first initialisation.
///
/// The lock guards lookup-or-insert only; it is never held while a stream
/// is waited on.
#[derive(Debug)]
pub struct HostReadbackCache {
    bytes: usize,
    slots: Mutex<HashMap<DeviceId, HostAllocation>>,
}

impl HostReadbackCache {
    pub fn new(bytes: usize) -> Self {
        Self {
            bytes,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Allocates the buffer for `device` unless one exists already.
    pub fn ensure(&self, device: &Device) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| internal("host readback cache poisoned"))?;
        if !slots.contains_key(&device.id()) {
            let allocation = device.allocate_host(self.bytes)?;
            debug!(device = %device.id(), bytes = self.bytes, "host readback buffer allocated");
            slots.insert(device.id(), allocation);
        }
        Ok(())
    }

    /// Buffer for `device`; missing means the node was never initialised there.
    pub fn get(&self, device: DeviceId) -> Result<HostAllocation> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| internal("host readback cache poisoned"))?;
        slots.get(&device).cloned().ok_or_else(|| {
            Error::Internal(format!("no host readback buffer initialised for {device}"))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
