// SPDX-License-Identifier: Apache-2.0

//! Flat string properties and the typed settings snapshot derived from them.
//!
//! Properties stay stringly-typed in the store because the wire API exposes
//! get/set on raw strings; the daemon derives one [`TunerSettings`] snapshot
//! at boot and keeps using that.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Property keys consumed by the core.
pub mod keys {
    /// Minimum spacing between two requests of one thread (milliseconds).
    pub const DELTA_MS: &str = "restune.delta.ms";
    /// Health penalty applied on a violation.
    pub const PENALTY: &str = "restune.penalty";
    /// Health reward applied on a well-spaced request.
    pub const REWARD: &str = "restune.reward";
    /// Global cap on concurrently active tune requests.
    pub const MAX_CONCURRENT: &str = "restune.max.concurrent.requests";
    /// Pulse monitor period (milliseconds).
    pub const PULSE_MS: &str = "restune.pulse.duration.ms";
    /// Handle garbage collector period (milliseconds).
    pub const GC_MS: &str = "restune.gc.duration.ms";
    /// Max tids reclaimed per garbage collection round.
    pub const GC_BATCH: &str = "restune.gc.batch.size";
    /// Unix socket the listener binds.
    pub const SOCKET_PATH: &str = "restune.listening.socket";
    /// Log level for daemon logs.
    pub const LOG_LEVEL: &str = "restune.logging.level";
}

/// Log level for daemon logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Logging is completely disabled.
    Off,
    /// Debug level logging.
    Debug,
    /// Info level logging.
    #[default]
    Info,
    /// Warn level logging.
    Warn,
    /// Error level logging.
    Error,
}

impl LogLevel {
    /// The `tracing` env-filter directive for this level.
    #[must_use]
    pub const fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(LogLevel::Off),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PropertiesFile {
    properties: BTreeMap<String, String>,
}

/// The flat property store.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    /// Loads the mandatory properties file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::MissingMandatory {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, &e))?;
        Self::from_yaml(&text, path)
    }

    /// Parses a properties map from a YAML string.
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, Error> {
        let file: PropertiesFile =
            serde_yaml::from_str(text).map_err(|e| Error::yaml(origin, &e))?;
        Ok(Self {
            values: file.properties,
        })
    }

    /// Raw lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Raw lookup with a caller-supplied fallback, as served to prop-get
    /// requests over the wire.
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, fallback: &'a str) -> &'a str {
        self.get(key).unwrap_or(fallback)
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn set(&mut self, key: &str, value: &str) -> Option<String> {
        self.values.insert(key.to_owned(), value.to_owned())
    }

    fn parsed<T: FromStr>(&self, key: &str, expected: &'static str) -> Result<Option<T>, Error> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                Error::InvalidProperty {
                    key: key.to_owned(),
                    expected,
                    value: raw.to_owned(),
                }
            }),
        }
    }

    /// Derives the typed settings snapshot the core runs with. Unset keys
    /// fall back to built-in defaults; unparsable values are errors.
    pub fn tuner_settings(&self) -> Result<TunerSettings, Error> {
        let defaults = TunerSettings::default();
        Ok(TunerSettings {
            delta_ms: self
                .parsed(keys::DELTA_MS, "integer")?
                .unwrap_or(defaults.delta_ms),
            penalty: self
                .parsed(keys::PENALTY, "float")?
                .unwrap_or(defaults.penalty),
            reward: self
                .parsed(keys::REWARD, "float")?
                .unwrap_or(defaults.reward),
            max_concurrent_requests: self
                .parsed(keys::MAX_CONCURRENT, "integer")?
                .unwrap_or(defaults.max_concurrent_requests),
            pulse_duration_ms: self
                .parsed(keys::PULSE_MS, "integer")?
                .unwrap_or(defaults.pulse_duration_ms),
            gc_duration_ms: self
                .parsed(keys::GC_MS, "integer")?
                .unwrap_or(defaults.gc_duration_ms),
            gc_batch_size: self
                .parsed(keys::GC_BATCH, "integer")?
                .unwrap_or(defaults.gc_batch_size),
            socket_path: self
                .get(keys::SOCKET_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_path),
            log_level: match self.get(keys::LOG_LEVEL) {
                None => defaults.log_level,
                Some(raw) => raw.parse().map_err(|()| Error::InvalidProperty {
                    key: keys::LOG_LEVEL.to_owned(),
                    expected: "log level",
                    value: raw.to_owned(),
                })?,
            },
        })
    }
}

/// Typed settings snapshot consumed by the engine and the listener.
#[derive(Debug, Clone, PartialEq)]
pub struct TunerSettings {
    /// Rate limiter spacing threshold, milliseconds.
    pub delta_ms: u64,
    /// Rate limiter health penalty.
    pub penalty: f64,
    /// Rate limiter health reward.
    pub reward: f64,
    /// Global cap on concurrently active tune requests.
    pub max_concurrent_requests: usize,
    /// Pulse monitor period, milliseconds.
    pub pulse_duration_ms: u64,
    /// Handle garbage collector period, milliseconds.
    pub gc_duration_ms: u64,
    /// Max tids reclaimed per garbage collection round.
    pub gc_batch_size: usize,
    /// Unix socket the listener binds.
    pub socket_path: PathBuf,
    /// Daemon log level.
    pub log_level: LogLevel,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            delta_ms: 16,
            penalty: 10.0,
            reward: 1.0,
            max_concurrent_requests: 64,
            pulse_duration_ms: 60_000,
            gc_duration_ms: 90_000,
            gc_batch_size: 16,
            socket_path: PathBuf::from("/run/resource-tuner/restune.sock"),
            log_level: LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn origin() -> PathBuf {
        PathBuf::from("properties.yaml")
    }

    #[test]
    fn settings_pick_up_overrides_and_defaults() {
        let yaml = r#"
properties:
  restune.delta.ms: "25"
  restune.penalty: "12.5"
  restune.max.concurrent.requests: "8"
  restune.logging.level: "debug"
"#;
        let props = Properties::from_yaml(yaml, &origin()).unwrap();
        let settings = props.tuner_settings().unwrap();
        assert_eq!(settings.delta_ms, 25);
        assert_eq!(settings.penalty, 12.5);
        assert_eq!(settings.max_concurrent_requests, 8);
        assert_eq!(settings.log_level, LogLevel::Debug);
        // Unset keys keep their defaults.
        assert_eq!(settings.reward, 1.0);
        assert_eq!(settings.gc_batch_size, 16);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let yaml = r#"
properties:
  restune.delta.ms: "soon"
"#;
        let props = Properties::from_yaml(yaml, &origin()).unwrap();
        assert!(matches!(
            props.tuner_settings(),
            Err(Error::InvalidProperty { .. })
        ));
    }

    #[test]
    fn get_or_serves_caller_fallback() {
        let props = Properties::default();
        assert_eq!(props.get_or("restune.absent", "fallback"), "fallback");
    }

    #[test]
    fn set_replaces_and_returns_previous() {
        let mut props = Properties::default();
        assert_eq!(props.set("k", "v1"), None);
        assert_eq!(props.set("k", "v2"), Some("v1".to_owned()));
        assert_eq!(props.get("k"), Some("v2"));
    }
}
