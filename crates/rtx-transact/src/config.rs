use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TransactError, TransactResult};

/// Flush policy for the journal log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every record (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    #[default]
    OsDefault,
}

/// Configuration for the transaction journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Location of the journal log file.
    pub path: PathBuf,
    pub sync_mode: SyncMode,
    /// Log size in bytes past which the journal checkpoints as soon as no
    /// transaction is open.
    pub checkpoint_threshold: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("rtx.journal"),
            sync_mode: SyncMode::default(),
            checkpoint_threshold: 1024 * 1024, // 1 MiB
        }
    }
}

/// Configuration for the transactional persistence layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactConfig {
    /// Admission permits: the maximum number of concurrently open
    /// non-exclusive transactions.
    pub max_concurrent_transactions: usize,
    pub journal: JournalConfig,
}

impl Default for TransactConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transactions: 1024,
            journal: JournalConfig::default(),
        }
    }
}

impl TransactConfig {
    /// Parse from TOML. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> TransactResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| TransactError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> TransactResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_toml_string(&self) -> TransactResult<String> {
        toml::to_string_pretty(self).map_err(|e| TransactError::Config(e.to_string()))
    }

    pub fn validate(&self) -> TransactResult<()> {
        if self.max_concurrent_transactions == 0 {
            return Err(TransactError::Config(
                "max_concurrent_transactions must be at least 1".into(),
            ));
        }
        if self.max_concurrent_transactions > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(TransactError::Config(format!(
                "max_concurrent_transactions exceeds {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = TransactConfig::default();
        assert_eq!(c.max_concurrent_transactions, 1024);
        assert_eq!(c.journal.sync_mode, SyncMode::OsDefault);
        assert_eq!(c.journal.checkpoint_threshold, 1024 * 1024);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let c = TransactConfig::from_toml_str(
            r#"
            max_concurrent_transactions = 8

            [journal]
            path = "/var/lib/rtx/journal"
            sync_mode = "every_write"
            "#,
        )
        .unwrap();
        assert_eq!(c.max_concurrent_transactions, 8);
        assert_eq!(c.journal.path, PathBuf::from("/var/lib/rtx/journal"));
        assert_eq!(c.journal.sync_mode, SyncMode::EveryWrite);
        assert_eq!(c.journal.checkpoint_threshold, 1024 * 1024);
    }

    #[test]
    fn zero_permits_rejected() {
        let err = TransactConfig::from_toml_str("max_concurrent_transactions = 0").unwrap_err();
        assert!(matches!(err, TransactError::Config(_)));
    }

    #[test]
    fn toml_roundtrip() {
        let c = TransactConfig::default();
        let text = c.to_toml_string().unwrap();
        assert_eq!(TransactConfig::from_toml_str(&text).unwrap(), c);
    }
}
