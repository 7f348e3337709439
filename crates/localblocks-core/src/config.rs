//! Local blocks processor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Default encoding version for new blocks
pub const DEFAULT_BLOCK_VERSION: &str = "v1";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// Settings handed to the encoding when a write-ahead block is compacted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub version: String,
    pub compression: Compression,
    pub zstd_level: i32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_BLOCK_VERSION.to_string(),
            compression: Compression::Zstd,
            zstd_level: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBlocksConfig {
    pub block: BlockConfig,
    /// A trace with no new spans for this long is cut into the head block
    #[serde(with = "humantime_duration")]
    pub trace_idle_period: Duration,
    #[serde(with = "humantime_duration")]
    pub max_block_duration: Duration,
    pub max_block_bytes: u64,
    /// Retention for write-ahead and complete blocks, measured from block end time
    #[serde(with = "humantime_duration")]
    pub complete_block_timeout: Duration,
    /// 0 disables the limit
    pub max_live_traces: u64,
    #[serde(with = "humantime_duration")]
    pub flush_check_period: Duration,
}

impl Default for LocalBlocksConfig {
    fn default() -> Self {
        Self {
            block: BlockConfig::default(),
            trace_idle_period: Duration::from_secs(10),
            max_block_duration: Duration::from_secs(60),
            max_block_bytes: 500_000_000,
            complete_block_timeout: Duration::from_secs(60 * 60),
            max_live_traces: 0,
            flush_check_period: Duration::from_secs(10),
        }
    }
}

impl LocalBlocksConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_check_period.is_zero() {
            return Err(Error::Config("flush_check_period must be greater than zero".into()));
        }
        if self.block.compression == Compression::Zstd && !(1..=22).contains(&self.block.zstd_level) {
            return Err(Error::Config(format!(
                "block.zstd_level must be between 1 and 22, got {}",
                self.block.zstd_level
            )));
        }
        Ok(())
    }
}

/// Tenant ids name directories and segment files, so path separators and
/// the segment field separator are not allowed.
pub fn validate_tenant(tenant: &str) -> Result<()> {
    if tenant.is_empty() || tenant.contains(['+', '/', '\\']) || tenant == "." || tenant == ".." {
        return Err(Error::Config(format!("invalid tenant id {:?}", tenant)));
    }
    Ok(())
}

/// Serde adapter for durations written as "10s", "1m30s", "1h".
pub mod humantime_duration {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LocalBlocksConfig::default();
        assert_eq!(cfg.flush_check_period, Duration::from_secs(10));
        assert_eq!(cfg.max_block_duration, Duration::from_secs(60));
        assert_eq!(cfg.complete_block_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.max_live_traces, 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_with_partial_overrides() {
        let cfg: LocalBlocksConfig = toml::from_str(
            r#"
            trace_idle_period = "2s"
            max_block_duration = "5m"
            max_block_bytes = 1048576
            max_live_traces = 5000

            [block]
            compression = "none"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.trace_idle_period, Duration::from_secs(2));
        assert_eq!(cfg.max_block_duration, Duration::from_secs(300));
        assert_eq!(cfg.max_block_bytes, 1_048_576);
        assert_eq!(cfg.max_live_traces, 5000);
        assert_eq!(cfg.block.compression, Compression::None);
        assert_eq!(cfg.block.version, DEFAULT_BLOCK_VERSION);
        // untouched fields keep their defaults
        assert_eq!(cfg.flush_check_period, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let res: std::result::Result<LocalBlocksConfig, _> =
            toml::from_str(r#"flush_check_period = "soon""#);
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_flush_period() {
        let cfg = LocalBlocksConfig {
            flush_check_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
