//! Environment-driven configuration helpers.
//!
//! Unique responsibility: read typed values from environment variables with
//! explicit defaults, so every `*Config::from_env()` in the crate behaves the same.
//!
//! In local dev `load_dotenv()` also reads `.env` from the current directory.
//! A missing `.env` is not an error.

use std::env;

use thiserror::Error;

/// Error raised while reading configuration from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Missing required environment variable.
    #[error("missing required env var: {0}")]
    Missing(&'static str),
    /// Invalid environment variable value.
    #[error("invalid env var {key}={value:?}: {reason}")]
    Invalid {
        /// The environment variable key.
        key: &'static str,
        /// The raw value found.
        value: String,
        /// The reason for invalidity.
        reason: &'static str,
    },
}

/// Load `.env` from the current directory, ignoring a missing file.
#[inline]
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Read a required variable.
///
/// # Errors
///
/// Returns `EnvError::Missing` if the variable is unset or empty.
pub fn must_env(key: &'static str) -> Result<String, EnvError> {
    optional_env(key).ok_or(EnvError::Missing(key))
}

/// Read an optional variable; empty values count as unset.
#[must_use]
pub fn optional_env(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read a string variable with a default.
#[must_use]
pub fn string_env(key: &'static str, default: &str) -> String {
    optional_env(key).unwrap_or_else(|| default.to_string())
}

/// Read a `u64` variable with a default.
///
/// # Errors
///
/// Returns `EnvError::Invalid` if the value is not an unsigned integer.
pub fn parse_u64_env(key: &'static str, default: u64) -> Result<u64, EnvError> {
    optional_env(key).map_or(Ok(default), |v| {
        v.trim().parse::<u64>().map_err(|_| EnvError::Invalid {
            key,
            value: v,
            reason: "expected an unsigned integer",
        })
    })
}

/// Read a `u32` variable with a default.
///
/// # Errors
///
/// Returns `EnvError::Invalid` if the value is not an unsigned integer.
pub fn parse_u32_env(key: &'static str, default: u32) -> Result<u32, EnvError> {
    optional_env(key).map_or(Ok(default), |v| {
        v.trim().parse::<u32>().map_err(|_| EnvError::Invalid {
            key,
            value: v,
            reason: "expected an unsigned integer",
        })
    })
}

/// Read a `usize` variable with a default.
///
/// # Errors
///
/// Returns `EnvError::Invalid` if the value is not an unsigned integer.
pub fn parse_usize_env(key: &'static str, default: usize) -> Result<usize, EnvError> {
    optional_env(key).map_or(Ok(default), |v| {
        v.trim().parse::<usize>().map_err(|_| EnvError::Invalid {
            key,
            value: v,
            reason: "expected an unsigned integer",
        })
    })
}

/// Read a boolean variable with a default.
///
/// Accepts `true/false`, `1/0` and `yes/no`, case-insensitive.
///
/// # Errors
///
/// Returns `EnvError::Invalid` for any other value.
pub fn parse_bool_env(key: &'static str, default: bool) -> Result<bool, EnvError> {
    optional_env(key).map_or(Ok(default), |v| parse_bool(&v).ok_or(EnvError::Invalid {
        key,
        value: v,
        reason: "expected a boolean (true/false, 1/0, yes/no)",
    }))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
