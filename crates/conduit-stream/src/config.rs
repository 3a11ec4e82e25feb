//! Stream defaults and their TOML configuration.
//!
//! Defaults are tracked per thread, like the event loop that drives the
//! streams built on that thread.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::path::Path;
use thiserror::Error;

/// Default high-water mark for byte streams (64 KiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Default high-water mark for object-mode streams (in chunks).
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

thread_local! {
    static BYTE_HWM: Cell<usize> = const { Cell::new(DEFAULT_HIGH_WATER_MARK) };
    static OBJECT_HWM: Cell<usize> = const { Cell::new(DEFAULT_OBJECT_HIGH_WATER_MARK) };
}

/// High-water mark used when a stream is built without an explicit one.
pub fn get_default_high_water_mark(object_mode: bool) -> usize {
    if object_mode {
        OBJECT_HWM.with(Cell::get)
    } else {
        BYTE_HWM.with(Cell::get)
    }
}

/// Change the default high-water mark for streams built on this thread.
pub fn set_default_high_water_mark(object_mode: bool, value: usize) {
    if object_mode {
        OBJECT_HWM.with(|c| c.set(value));
    } else {
        BYTE_HWM.with(|c| c.set(value));
    }
}

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid stream configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// `[streams]` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Default high-water mark for byte streams
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// Default high-water mark for object-mode streams
    #[serde(default = "default_object_high_water_mark")]
    pub object_high_water_mark: usize,
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

fn default_object_high_water_mark() -> usize {
    DEFAULT_OBJECT_HIGH_WATER_MARK
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            object_high_water_mark: DEFAULT_OBJECT_HIGH_WATER_MARK,
        }
    }
}

impl StreamConfig {
    /// Parse the table body (`high_water_mark = ...`).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a stream configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Install these values as this thread's defaults.
    pub fn apply(&self) {
        set_default_high_water_mark(false, self.high_water_mark);
        set_default_high_water_mark(true, self.object_high_water_mark);
        tracing::debug!(
            high_water_mark = self.high_water_mark,
            object_high_water_mark = self.object_high_water_mark,
            "stream defaults applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        assert_eq!(get_default_high_water_mark(false), 65536);
        assert_eq!(get_default_high_water_mark(true), 16);
        assert_eq!(StreamConfig::default().high_water_mark, 65536);
    }

    #[test]
    fn test_parse_partial_config() {
        let config = StreamConfig::from_toml_str("high_water_mark = 1024\n").unwrap();
        assert_eq!(config.high_water_mark, 1024);
        assert_eq!(config.object_high_water_mark, 16);
    }

    #[test]
    fn test_parse_error() {
        let err = StreamConfig::from_toml_str("high_water_mark = \"big\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_and_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "high_water_mark = 8\nobject_high_water_mark = 2").unwrap();

        let config = StreamConfig::load(file.path()).unwrap();
        config.apply();
        assert_eq!(get_default_high_water_mark(false), 8);
        assert_eq!(get_default_high_water_mark(true), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = StreamConfig::load(Path::new("/nonexistent/conduit.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
