//! Writer configuration
//!
//! Can be built fluently or loaded from TOML:
//!
//! ```toml
//! cluster_bits = 16
//! mode = "compressed"
//! backing_file = "/images/base.qcow2"
//! ```

use crate::error::{Qcow2Error, Result};
use crate::header::{MAX_CLUSTER_BITS, MIN_CLUSTER_BITS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CLUSTER_BITS: u32 = 16;

/// How the writer stores cluster payloads. Fixed for the lifetime of a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// One physical cluster per write; clusters may be written in any order
    #[default]
    Uncompressed,

    /// DEFLATE payloads packed back to back; clusters must be written in
    /// ascending order, each at most once
    Compressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// log2 of the cluster size
    pub cluster_bits: u32,

    pub mode: WriteMode,

    /// Image whose contents show through unwritten clusters
    pub backing_file: Option<PathBuf>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            cluster_bits: DEFAULT_CLUSTER_BITS,
            mode: WriteMode::Uncompressed,
            backing_file: None,
        }
    }
}

impl WriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_bits(mut self, cluster_bits: u32) -> Self {
        self.cluster_bits = cluster_bits;
        self
    }

    pub fn mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn compressed(self) -> Self {
        self.mode(WriteMode::Compressed)
    }

    pub fn backing_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.backing_file = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Qcow2Error::InvalidConfig(format!(
                "cluster_bits must be in {}..={}, got {}",
                MIN_CLUSTER_BITS, MAX_CLUSTER_BITS, self.cluster_bits
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: WriterConfig =
            toml::from_str(s).map_err(|e| Qcow2Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.cluster_bits, 16);
        assert_eq!(config.mode, WriteMode::Uncompressed);
        assert!(config.backing_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = WriterConfig::new()
            .cluster_bits(12)
            .compressed()
            .backing_file("/images/base.qcow2");
        assert_eq!(config.cluster_bits, 12);
        assert_eq!(config.mode, WriteMode::Compressed);
        assert_eq!(
            config.backing_file.as_deref(),
            Some(Path::new("/images/base.qcow2"))
        );
    }

    #[test]
    fn test_from_toml() {
        let config = WriterConfig::from_toml_str(
            r#"
            cluster_bits = 12
            mode = "compressed"
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster_bits, 12);
        assert_eq!(config.mode, WriteMode::Compressed);

        let config = WriterConfig::from_toml_str("").unwrap();
        assert_eq!(config, WriterConfig::default());
    }

    #[test]
    fn test_invalid_cluster_bits() {
        assert!(matches!(
            WriterConfig::new().cluster_bits(8).validate(),
            Err(Qcow2Error::InvalidConfig(_))
        ));
        assert!(matches!(
            WriterConfig::from_toml_str("cluster_bits = 30"),
            Err(Qcow2Error::InvalidConfig(_))
        ));
        assert!(matches!(
            WriterConfig::from_toml_str("mode = \"zstd\""),
            Err(Qcow2Error::InvalidConfig(_))
        ));
    }
}
