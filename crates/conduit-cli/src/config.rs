//! Configuration file parsing for conduit.toml.

use conduit_stream::StreamConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file names searched for, in order.
const CONFIG_NAMES: &[&str] = &["conduit.toml", ".conduitrc.toml"];

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Default high-water marks
    #[serde(default)]
    pub streams: StreamConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "warn".to_string()
}

/// Load configuration from a file or search for default config files.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config_path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => std::env::current_dir()
            .ok()
            .and_then(|cwd| find_config_file(&cwd)),
    };

    match config_path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "loaded configuration");
            Ok(config)
        }
        Some(path) => anyhow::bail!("Config file not found: {}", path.display()),
        None => Ok(Config::default()),
    }
}

/// Search `start` and its parent directories for a configuration file.
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.streams, StreamConfig::default());
    }

    #[test]
    fn test_parse_tables() {
        let config: Config = toml::from_str(
            "[streams]\nhigh_water_mark = 4096\n\n[log]\nlevel = \"debug\"\n",
        )
        .unwrap();
        assert_eq!(config.streams.high_water_mark, 4096);
        assert_eq!(config.streams.object_high_water_mark, 16);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_find_config_in_parent() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join("conduit.toml"), "[log]\nlevel = \"info\"\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, root.path().join("conduit.toml"));
        let config = load_config(Some(&found)).unwrap();
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_explicit_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.toml");
        std::fs::write(&path, "[streams]\nhigh_water_mark = \"lots\"\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse"));
    }
}
