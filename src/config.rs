//! Engine configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dns: DnsConfig,
    pub spf: SpfConfig,
    pub dkim: DkimConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Per-query bound. A timeout is a hard failure, not a miss.
    pub timeout_ms: u64,
    pub attempts: usize,
    /// Use the host resolver configuration instead of hickory's public defaults.
    pub use_system_config: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            attempts: 2,
            use_system_config: true,
        }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpfConfig {
    pub max_depth: usize,
    pub max_ranges: usize,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_ranges: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DkimConfig {
    pub max_selector_probes: usize,
    /// Appended to the built-in selector table before truncation.
    pub extra_selectors: Vec<String>,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            max_selector_probes: 8,
            extra_selectors: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dns.timeout_ms == 0 {
            return Err(ConfigError::Invalid("dns.timeout_ms must be > 0".into()));
        }
        if self.dns.attempts == 0 {
            return Err(ConfigError::Invalid("dns.attempts must be > 0".into()));
        }
        if self.spf.max_depth == 0 {
            return Err(ConfigError::Invalid("spf.max_depth must be > 0".into()));
        }
        if self.spf.max_ranges == 0 {
            return Err(ConfigError::Invalid("spf.max_ranges must be > 0".into()));
        }
        if self.dkim.max_selector_probes == 0 {
            return Err(ConfigError::Invalid(
                "dkim.max_selector_probes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.spf.max_depth, 10);
        assert_eq!(config.spf.max_ranges, 50);
        assert_eq!(config.dkim.max_selector_probes, 8);
        assert_eq!(config.dns.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [spf]
            max_depth = 4

            [dkim]
            extra_selectors = ["acme"]
            "#,
        )
        .unwrap();
        assert_eq!(config.spf.max_depth, 4);
        assert_eq!(config.spf.max_ranges, 50);
        assert_eq!(config.dkim.max_selector_probes, 8);
        assert_eq!(config.dkim.extra_selectors, vec!["acme".to_string()]);
    }

    #[test]
    fn zero_depth_is_rejected() {
        let err = EngineConfig::from_toml_str("[spf]\nmax_depth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = EngineConfig::from_toml_str("[dns\ntimeout_ms = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dns]\ntimeout_ms = 1500\nuse_system_config = false").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.dns.timeout_ms, 1500);
        assert!(!config.dns.use_system_config);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = EngineConfig::load("/nonexistent/mailposture.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
