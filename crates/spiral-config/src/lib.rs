//! Ambient configuration shared by the rank-k runtime crates.
//!
//! Every knob is read from `SPIRAL_*` environment variables exactly once and
//! cached for the lifetime of the process. Malformed values never abort: they
//! are reported through `tracing` and replaced by the documented default.

pub mod determinism;
pub mod device;
pub mod tracing;

pub(crate) mod env {
    use std::str::FromStr;

    /// Parses `key` as `T`, logging and discarding values that do not parse.
    pub(crate) fn parse<T: FromStr>(key: &str) -> Option<T> {
        let raw = std::env::var(key).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                ::tracing::warn!(key, value = trimmed, "ignoring malformed configuration value");
                None
            }
        }
    }

    /// Interprets the usual on/off spellings; `None` when unset or unknown.
    pub(crate) fn flag(key: &str) -> Option<bool> {
        let raw = std::env::var(key).ok()?;
        match raw.trim() {
            "1" | "true" | "True" | "TRUE" | "on" | "ON" | "yes" => Some(true),
            "0" | "false" | "False" | "FALSE" | "off" | "OFF" | "no" => Some(false),
            "" => None,
            other => {
                ::tracing::warn!(key, value = other, "ignoring malformed boolean flag");
                None
            }
        }
    }
}
