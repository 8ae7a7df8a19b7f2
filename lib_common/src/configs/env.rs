//! # Environment Readers
//!
//! Small typed accessors over environment variables. Every accessor takes a
//! default that is returned when the variable is unset; values that are set
//! but cannot be parsed also fall back to the default, with a warning, so a
//! typo in a deployment manifest never prevents the process from starting.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Reads configuration values through a lookup function.
///
/// `EnvReader::system()` reads the real process environment. Tests build a
/// reader over a map with [`EnvReader::new`] instead of mutating global state.
pub struct EnvReader<F> {
    lookup: F,
}

fn lookup_system(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl EnvReader<fn(&str) -> Option<String>> {
    /// A reader over the current process environment.
    pub fn system() -> Self {
        Self {
            lookup: lookup_system,
        }
    }
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Creates a reader over an arbitrary lookup function.
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Returns the raw value when the variable is present, even if it is empty.
    pub fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    /// Returns the value when present and non-empty, the default otherwise.
    pub fn non_empty(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    /// Returns `Some` only for a present, non-empty value.
    pub fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    /// Parses the value with `FromStr`.
    pub fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => default,
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(value) => value,
                Err(e) => {
                    warn!(key, value = %raw, error = %e, "invalid value in environment, using default");
                    default
                }
            },
        }
    }

    /// Parses a human readable duration such as `500ms`, `1s`, `15m` or `1h`.
    pub fn duration(&self, key: &str, default: Duration) -> Duration {
        match self.optional(key) {
            None => default,
            Some(raw) => match humantime::parse_duration(raw.trim()) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key, value = %raw, error = %e, "invalid duration in environment, using default");
                    default
                }
            },
        }
    }

    /// Parses a boolean flag (`true/false`, `1/0`, `yes/no`, `on/off`).
    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.optional(key) {
            None => default,
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "on" => true,
                "false" | "0" | "no" | "n" | "off" => false,
                _ => {
                    warn!(key, value = %raw, "invalid boolean in environment, using default");
                    default
                }
            },
        }
    }
}
