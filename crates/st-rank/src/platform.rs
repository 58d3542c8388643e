// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// crates/st-rank/src/platform.rs

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use spiral_config::device::DeviceConfig;

use crate::device::{Device, DeviceCaps};
use crate::error::{internal, Result};

static DEVICES: OnceLock<Mutex<HashMap<u32, Device>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u32, Device>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Process-wide device for `ordinal`, created on first use from
/// `SPIRAL_DEVICE_*` settings and shared by every later caller.
pub fn executor_for_device(ordinal: u32) -> Result<Device> {
    let mut devices = registry()
        .lock()
        .map_err(|_| internal("device registry poisoned"))?;
    if let Some(device) = devices.get(&ordinal) {
        return Ok(device.clone());
    }
    let caps = DeviceCaps::from_config(&DeviceConfig::from_env());
    let device = Device::new(ordinal, caps)?;
    devices.insert(ordinal, device.clone());
    Ok(device)
}
