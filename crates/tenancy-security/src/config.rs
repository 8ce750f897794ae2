//! Security Configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenancy_common::{TenancyError, TenancyResult};

/// Top-level configuration for the security components
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// 32-byte master key file. Required when backups are encrypted.
    pub key_path: Option<PathBuf>,
    /// Reject access to tables without an enforced row policy
    pub strict_mode: bool,
    /// Record access denials and violations in the security logs
    pub auditing_enabled: bool,
    /// Tables to put under the row policy at startup
    pub isolated_tables: Vec<String>,
    /// Audit buffer settings
    pub audit: AuditConfig,
    /// Backup settings
    pub backup: BackupConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/opentenancy/tenancy.db"),
            key_path: None,
            strict_mode: true,
            auditing_enabled: true,
            isolated_tables: Vec::new(),
            audit: AuditConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

/// Audit buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Entries buffered before a flush is forced
    pub buffer_capacity: usize,
    /// Periodic flush interval
    pub flush_interval_secs: u64,
    /// Upper bound on the final flush at shutdown
    pub shutdown_timeout_secs: u64,
    /// Entries kept for retry after failed flushes before the oldest are dropped
    pub max_retained_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            flush_interval_secs: 10,
            shutdown_timeout_secs: 5,
            max_retained_entries: 10_000,
        }
    }
}

impl AuditConfig {
    /// Flush interval as a [`Duration`]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Shutdown timeout as a [`Duration`]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root directory; each tenant gets `tenant_<id>/` below it
    pub backup_dir: PathBuf,
    /// Retention applied to new backups
    pub default_retention_days: u32,
    /// Encrypt backup payloads with the master key
    pub encrypt: bool,
    /// Retention sweep interval
    pub sweep_interval_secs: u64,
    /// Pending/running records older than this are marked failed by the sweeper
    pub stale_after_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/lib/opentenancy/backups"),
            default_retention_days: 30,
            encrypt: true,
            sweep_interval_secs: 3600,
            stale_after_secs: 6 * 3600,
        }
    }
}

impl BackupConfig {
    /// Sweep interval as a [`Duration`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Stale threshold as a [`chrono::Duration`]
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

impl SecurityConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> TenancyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TenancyError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TenancyError::Configuration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> TenancyResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TenancyError::Configuration(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> TenancyResult<()> {
        if self.audit.buffer_capacity == 0 {
            return Err(TenancyError::Configuration(
                "audit.buffer_capacity must be positive".into(),
            ));
        }
        if self.audit.flush_interval_secs == 0 {
            return Err(TenancyError::Configuration(
                "audit.flush_interval_secs must be positive".into(),
            ));
        }
        if self.audit.max_retained_entries < self.audit.buffer_capacity {
            return Err(TenancyError::Configuration(
                "audit.max_retained_entries must be at least audit.buffer_capacity".into(),
            ));
        }
        if self.backup.default_retention_days == 0 {
            return Err(TenancyError::Configuration(
                "backup.default_retention_days must be positive".into(),
            ));
        }
        if self.backup.sweep_interval_secs == 0 {
            return Err(TenancyError::Configuration(
                "backup.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.backup.encrypt && self.key_path.is_none() {
            return Err(TenancyError::Configuration(
                "backup.encrypt requires key_path".into(),
            ));
        }
        for table in &self.isolated_tables {
            tenancy_common::validate_identifier(table)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SecurityConfig = toml::from_str(
            r#"
            database_path = "/tmp/t.db"
            key_path = "/tmp/master.key"

            [audit]
            buffer_capacity = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.audit.buffer_capacity, 5);
        assert_eq!(config.audit.flush_interval_secs, 10);
        assert_eq!(config.backup.default_retention_days, 30);
        assert!(config.strict_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_encryption_requires_key() {
        let config = SecurityConfig::default();
        assert!(matches!(
            config.validate(),
            Err(TenancyError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let mut config = SecurityConfig::default();
        config.backup.encrypt = false;
        config.isolated_tables = vec!["orders; --".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenancy.toml");
        let mut config = SecurityConfig::default();
        config.key_path = Some(dir.path().join("master.key"));
        config.isolated_tables = vec!["orders".into()];
        config.save(&path).unwrap();

        let loaded = SecurityConfig::load(&path).unwrap();
        assert_eq!(loaded.isolated_tables, vec!["orders".to_string()]);
        assert_eq!(loaded.key_path, config.key_path);
    }
}
