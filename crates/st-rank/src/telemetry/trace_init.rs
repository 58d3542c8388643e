// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::sync::OnceLock;

use spiral_config::tracing::{self as config_tracing, InitError};
use tracing::warn;

static SUBSCRIBER: OnceLock<bool> = OnceLock::new();

/// Installs the process subscriber on first call; later calls are no-ops.
///
/// Returns whether a subscriber owned by this process is active. A host
/// application that installed its own subscriber first is left alone.
pub fn init_tracing() -> bool {
    *SUBSCRIBER.get_or_init(|| match config_tracing::init_tracing() {
        Ok(()) => true,
        Err(InitError::AlreadyInitialised) => true,
        Err(err) => {
            warn!("tracing subscriber not installed: {err}");
            false
        }
    })
}

/// Flushes any trace file before the process exits.
pub fn shutdown_tracing() {
    if SUBSCRIBER.get().copied().unwrap_or(false) {
        config_tracing::flush_chrome_trace();
    }
}
