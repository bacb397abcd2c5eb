use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Parquet-adapter compression codec. Carried in the config even though the
/// Parquet codec itself lives outside the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Snappy,
    Gzip,
    Zstd,
    Lz4,
    None,
}

/// Engine configuration, deserializable from whatever config source the
/// embedding process uses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for persisted databases.
    pub database_dir: PathBuf,
    /// Background flush cadence, seconds.
    pub flush_interval_secs: u64,
    /// Idle sessions older than this are garbage collected, seconds.
    pub session_max_age_secs: u64,
    /// Session GC cadence, seconds.
    pub session_gc_interval_secs: u64,
    pub compression: Compression,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("./database"),
            flush_interval_secs: 30,
            session_max_age_secs: 8 * 60 * 60,
            session_gc_interval_secs: 60,
            compression: Compression::Snappy,
        }
    }
}

impl EngineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn session_gc_interval(&self) -> Duration {
        Duration::from_secs(self.session_gc_interval_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.database_dir, PathBuf::from("./database"));
        assert_eq!(config.flush_interval(), Duration::from_secs(30));
        assert_eq!(config.compression, Compression::Snappy);
    }

    #[test]
    fn partial_json_overrides() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"flush_interval_secs": 5, "compression": "zstd"}"#).unwrap();
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.compression, Compression::Zstd);
        assert_eq!(config.session_gc_interval(), Duration::from_secs(60));
    }
}
