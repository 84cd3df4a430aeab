//! Configuration file
//!
//! Read from `$XDG_CONFIG_HOME/loggoblin/config.toml` (or
//! `~/.config/loggoblin/config.toml`) when present. Every section is optional.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use loggoblin_logs::{DEFAULT_CAPACITY, MuxConfig, NormalizerConfig, ReaderConfig};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Filter rules, highest priority first
    pub rules: Vec<String>,
    pub scrollback: ScrollbackConfig,
    pub multiplexer: MuxConfig,
    pub reader: ReaderConfig,
    pub normalizer: NormalizerConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScrollbackConfig {
    pub capacity: usize,
}

impl Default for ScrollbackConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        let base = match env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(env::var_os("HOME")?).join(".config"),
        };
        Some(base.join("loggoblin").join("config.toml"))
    }

    /// Load the configuration
    ///
    /// An explicit path must exist. Without one, a missing default file
    /// yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loggoblin_logs::BackpressurePolicy;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.rules.is_empty());
        assert_eq!(config.scrollback.capacity, 10_000);
        assert_eq!(config.multiplexer.backpressure, BackpressurePolicy::Block);
        assert_eq!(config.multiplexer.lookahead, 64);
        assert_eq!(config.reader.max_reopen_attempts, 5);
        assert!(config.normalizer.zoom.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = Config::parse(
            r#"
rules = ["exclude severity<INFO", "include /timeout/i"]

[scrollback]
capacity = 500

[multiplexer]
backpressure = "drop_oldest"
lookahead = 8
stall_grace_ms = 100
sample_drop_fraction = 0.25

[reader]
max_reopen_attempts = 2
poll_interval_ms = 50
start_at_end = true

[normalizer]
zoom = ["level", "message"]
[[normalizer.timestamps]]
pattern = '^\[(?P<ts>[^\]]+)\]'
format = "%d/%b/%Y:%H:%M:%S %z"
[[normalizer.severities]]
pattern = 'E\d{4}'
level = "error"
"#,
        )
        .unwrap();

        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.scrollback.capacity, 500);
        assert_eq!(config.multiplexer.backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(config.multiplexer.lookahead, 8);
        assert_eq!(config.multiplexer.sample_drop_fraction, 0.25);
        assert_eq!(config.reader.max_reopen_attempts, 2);
        assert_eq!(config.reader.initial_backoff_ms, 100);
        assert!(config.reader.start_at_end);
        assert_eq!(config.normalizer.zoom, vec!["level", "message"]);
        assert_eq!(config.normalizer.timestamps.len(), 1);
        assert_eq!(config.normalizer.severities[0].level, "error");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(Config::parse("rulez = []").is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("config.toml");
        fs::write(&path, "rules = [\"- /noise/\"]\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.rules, vec!["- /noise/"]);
    }
}
