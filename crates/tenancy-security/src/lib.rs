//! OpenTenancy Security - tenant isolation and auditability
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        TENANCY SERVICES                             │
//! │                                                                     │
//! │  ┌────────────────┐  ┌────────────────┐  ┌──────────────────────┐  │
//! │  │ TenantContext  │  │  Encryption    │  │  AuditLogManager     │  │
//! │  │   Manager      │  │   Manager      │  │  mpsc → flusher task │  │
//! │  │ bind / verify  │  │ AES-256-GCM    │  │  hash-chained rows   │  │
//! │  └───────┬────────┘  └───────┬────────┘  └──────────▲───────────┘  │
//! │          │                   │                      │ audit        │
//! │          │           ┌───────▼──────────────────────┴───────────┐  │
//! │          │           │        BackupIsolationManager            │  │
//! │          │           │  pending → running → complete | failed   │  │
//! │          │           │  tenant_<id>/backup_<ts>_<type>_*.bak    │  │
//! │          │           └───────┬───────────────▲──────────────────┘  │
//! │          │                   │               │ RetentionSweeper    │
//! │  ┌───────▼───────────────────▼───────────────┴──────────────────┐  │
//! │  │           tenancy_common::Database (row policy)              │  │
//! │  └──────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audit;
pub mod backup;
pub mod config;
pub mod context;
pub mod encryption;
pub mod sweeper;

pub use audit::{AuditFilter, AuditLogEntry, AuditLogManager, AuditStatus, ChainVerification, ExportFormat};
pub use backup::{BackupIsolationManager, BackupRecord, BackupStatus, BackupType};
pub use config::{AuditConfig, BackupConfig, SecurityConfig};
pub use context::{TableOperation, TenantContext, TenantContextManager};
pub use encryption::{EncryptionManager, SensitiveField};
pub use sweeper::{RetentionSweeper, SweepReport};

use std::sync::Arc;
use tenancy_common::{Database, TenancyError, TenancyResult};
use tracing::{info, warn};

/// All security components wired to one database
pub struct TenancyServices {
    /// Shared database handle
    pub db: Database,
    /// Field encryption, when a key is configured
    pub encryption: Option<Arc<EncryptionManager>>,
    /// Tenant binding and access checks
    pub contexts: Arc<TenantContextManager>,
    /// Audit trail writer
    pub audit: Arc<AuditLogManager>,
    /// Per-tenant backups
    pub backups: Arc<BackupIsolationManager>,
}

impl TenancyServices {
    /// Open the database, load the key and start the audit flusher.
    /// Must run inside a tokio runtime.
    pub fn start(config: &SecurityConfig) -> TenancyResult<Self> {
        config.validate()?;
        let db = Database::open(&config.database_path)?;
        for table in &config.isolated_tables {
            db.enable_isolation(table)?;
        }
        Self::with_database(db, config)
    }

    /// Same as [`start`](Self::start) over an already-open database
    pub fn with_database(db: Database, config: &SecurityConfig) -> TenancyResult<Self> {
        let encryption = match &config.key_path {
            Some(path) => Some(Arc::new(EncryptionManager::from_key_file(path)?)),
            None => None,
        };
        if config.backup.encrypt && encryption.is_none() {
            return Err(TenancyError::Configuration(
                "backup encryption enabled without a key".into(),
            ));
        }

        let contexts = TenantContextManager::new(db.clone());
        contexts.set_strict_mode(config.strict_mode);
        contexts.set_auditing_enabled(config.auditing_enabled);

        let audit = Arc::new(AuditLogManager::start(db.clone(), &config.audit));
        let backups = Arc::new(BackupIsolationManager::new(
            db.clone(),
            config.backup.backup_dir.clone(),
            encryption.clone().filter(|_| config.backup.encrypt),
            Arc::clone(&audit),
            config.backup.default_retention_days,
        ));

        info!(
            strict_mode = config.strict_mode,
            encrypted_backups = config.backup.encrypt,
            "Tenancy services started"
        );
        Ok(Self {
            db,
            encryption,
            contexts: Arc::new(contexts),
            audit,
            backups,
        })
    }

    /// Start the background retention sweeper
    pub fn spawn_sweeper(&self, config: &BackupConfig) -> RetentionSweeper {
        RetentionSweeper::spawn(Arc::clone(&self.backups), config)
    }

    /// Write deferred security-log rows, then flush and close the audit log
    pub async fn shutdown(&self) -> TenancyResult<()> {
        if let Err(e) = self.contexts.flush_security_logs() {
            warn!(error = %e, "Deferred security log rows were not written");
        }
        self.audit.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use tenancy_common::now_millis;

    fn config(dir: &std::path::Path) -> SecurityConfig {
        let key_path = dir.join("master.key");
        EncryptionManager::generate_key_file(&key_path).unwrap();
        let mut config = SecurityConfig {
            database_path: dir.join("tenancy.db"),
            key_path: Some(key_path),
            isolated_tables: vec![],
            ..SecurityConfig::default()
        };
        config.backup.backup_dir = dir.join("backups");
        config
    }

    #[tokio::test]
    async fn test_two_tenant_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("tenancy.db")).unwrap();
        db.with_system(|conn| {
            conn.execute_batch(
                "CREATE TABLE orders (
                    id INTEGER PRIMARY KEY,
                    tenant_id INTEGER NOT NULL,
                    item TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );",
            )?;
            Ok(())
        })
        .unwrap();
        db.enable_isolation("orders").unwrap();
        let services = TenancyServices::with_database(db.clone(), &config(dir.path())).unwrap();

        for (id, tenant, item) in [(1, 7, "margherita"), (2, 8, "ramen")] {
            db.with_tenant(tenant, |tx| {
                tx.execute(
                    "INSERT INTO orders (id, tenant_id, item, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, tenant, item, now_millis()],
                )?;
                Ok(())
            })
            .unwrap();
        }

        // Tenant 7 cannot read tenant 8 through the access check
        assert!(services.contexts.verify_tenant_access(7, 7));
        assert!(!services.contexts.verify_tenant_access(7, 8));
        services
            .contexts
            .verify_table_access(7, "orders", TableOperation::Select)
            .unwrap();

        let backup = services
            .backups
            .create_tenant_backup(7, BackupType::Full)
            .await
            .unwrap();
        assert_eq!(backup.status, BackupStatus::Complete);
        assert!(backup.encrypted);

        let stolen = services.backups.restore_tenant_backup(8, backup.id).await;
        assert!(stolen.is_err());

        let restored = services.backups.restore_tenant_backup(7, backup.id).await.unwrap();
        assert_eq!(restored.rows_restored, 1);

        services.shutdown().await.unwrap();

        let seven: Vec<String> = services
            .audit
            .get_audit_logs(7, 100, 0)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(seven.contains(&"backup_created".to_string()));
        assert!(seven.contains(&"backup_restored".to_string()));

        let eight = services
            .audit
            .query(&AuditFilter::tenant(8).status(AuditStatus::Failure))
            .unwrap();
        assert_eq!(eight.len(), 1);
        assert_eq!(eight[0].action, "backup_restore_failed");
        assert!(services.audit.verify_chain(7).unwrap().valid);

        let denials = services.contexts.security_events(7, 10).unwrap();
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].attempted_tenant_id, 8);
    }

    #[tokio::test]
    async fn test_start_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.backup.encrypt = false;
        let services = TenancyServices::start(&config).unwrap();
        assert!(services.encryption.is_some());
        let record = services
            .backups
            .create_tenant_backup(3, BackupType::Full)
            .await
            .unwrap();
        assert!(!record.encrypted);
        services.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.key_path = Some(dir.path().join("absent.key"));
        assert!(matches!(
            TenancyServices::start(&config),
            Err(TenancyError::Configuration(_))
        ));
    }
}
