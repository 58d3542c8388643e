// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy of the runtime.
///
/// `InvalidArgument` and `ResourceExhausted` are launch-time failures: they are
/// returned before anything is enqueued. `ExecutionFault` is only ever observed
/// at a synchronisation point and invalidates every output written since the
/// previous one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("execution fault: {0}")]
    ExecutionFault(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub fn invalid(m: &str) -> Error {
    Error::InvalidArgument(m.to_string())
}
pub fn exhausted(m: &str) -> Error {
    Error::ResourceExhausted(m.to_string())
}
pub fn fault(m: &str) -> Error {
    Error::ExecutionFault(m.to_string())
}
pub fn internal(m: &str) -> Error {
    Error::Internal(m.to_string())
}

/// Stable status codes, numbered like the canonical RPC codes so they can be
/// forwarded through C-style interfaces unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    InvalidArgument = 3,
    ResourceExhausted = 8,
    Internal = 13,
    Aborted = 10,
}

impl StatusCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Aborted => "ABORTED",
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(StatusCode::Ok),
            3 => Some(StatusCode::InvalidArgument),
            8 => Some(StatusCode::ResourceExhausted),
            10 => Some(StatusCode::Aborted),
            13 => Some(StatusCode::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Execution faults map to `Aborted`: the call's outputs are void but the
    /// stream remains usable after the synchronisation that reported it.
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            Error::ExecutionFault(_) => StatusCode::Aborted,
            Error::Internal(_) => StatusCode::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::InvalidArgument(m)
            | Error::ResourceExhausted(m)
            | Error::ExecutionFault(m)
            | Error::Internal(m) => m,
        }
    }

    /// Status of a `Result`, `Ok` for success.
    pub fn status_of<T>(result: &Result<T>) -> StatusCode {
        match result {
            Ok(_) => StatusCode::Ok,
            Err(err) => err.code(),
        }
    }
}
