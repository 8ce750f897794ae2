//! Backup Isolation
//!
//! Per-tenant backups of every isolated data table. Rows are read through
//! the tenant-bound scoped views, written as a JSON-lines artifact under
//! `<backup_dir>/tenant_<id>/` and optionally sealed with the master key.
//! Record status only moves forward: pending → running → complete | failed.

use crate::audit::{AuditLogEntry, AuditLogManager};
use crate::encryption::EncryptionManager;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tenancy_common::{
    from_millis, now_millis, table_columns, to_millis, validate_identifier, Cmp, Database,
    FilterQuery, TenancyError, TenancyResult, TenantId, TenantTx, UserId,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// User id recorded on audit entries the backup manager writes itself
pub const SYSTEM_USER_ID: UserId = 0;

const PAYLOAD_FORMAT: &str = "opentenancy-backup/1";
const MILLIS_PER_DAY: i64 = 86_400_000;
const LIST_LIMIT: i64 = 100;

const BACKUP_COLUMNS: &str = "id, tenant_id, backup_type, status, start_time, end_time, size, \
                              location, retention_days, verified, encrypted, key_id, \
                              checksum, error_message";

/// Backup type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Every row
    Full,
    /// Rows changed since the last complete backup of any type
    Incremental,
    /// Rows changed since the last complete full backup
    Differential,
}

impl BackupType {
    /// Stored form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Differential => "differential",
        }
    }

    /// Inverse of [`BackupType::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            "differential" => Some(Self::Differential),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backup status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Record created, nothing written yet
    Pending,
    /// Payload being built and written
    Running,
    /// Artifact written and checksummed
    Complete,
    /// Gave up; `error_message` says why
    Failed,
}

impl BackupStatus {
    /// Stored form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Inverse of [`BackupStatus::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Complete and failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Forward-only transitions
    pub fn can_advance_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored backup record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Storage id
    pub id: i64,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Full, incremental or differential
    pub backup_type: BackupType,
    /// Lifecycle state
    pub status: BackupStatus,
    /// When the record was created
    pub start_time: DateTime<Utc>,
    /// When it reached a terminal state
    pub end_time: Option<DateTime<Utc>>,
    /// Artifact size in bytes
    pub size: u64,
    /// Artifact path
    pub location: PathBuf,
    /// Days kept after `start_time`
    pub retention_days: u32,
    /// Last integrity check passed
    pub verified: bool,
    /// Artifact is sealed
    pub encrypted: bool,
    /// Fingerprint of the key the artifact was sealed under
    pub key_id: Option<String>,
    /// SHA-256 of the artifact, hex
    pub checksum: Option<String>,
    /// Failure reason
    pub error_message: Option<String>,
}

impl BackupRecord {
    /// Age strictly greater than the retention period
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.start_time > ChronoDuration::days(self.retention_days as i64)
    }
}

/// Per-tenant backup summary
#[derive(Debug, Clone, Serialize)]
pub struct BackupStatusSummary {
    /// Tenant summarised
    pub tenant_id: TenantId,
    /// Records per status
    pub status_counts: BTreeMap<String, u64>,
    /// Recorded bytes across every status
    pub total_size: u64,
    /// Retention for new backups
    pub default_retention_days: u32,
    /// New artifacts are sealed
    pub encryption_enabled: bool,
    /// When the summary was taken
    pub generated_at: DateTime<Utc>,
}

/// Result of a restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    /// Backup replayed
    pub backup_id: i64,
    /// Tenant restored
    pub tenant_id: TenantId,
    /// Rows written
    pub rows_restored: u64,
    /// Tables in the payload
    pub tables: Vec<String>,
}

/// Result of an integrity check
#[derive(Debug, Clone, Serialize)]
pub struct BackupVerification {
    /// Backup checked
    pub backup_id: i64,
    /// Artifact exists on disk
    pub artifact_present: bool,
    /// On-disk size equals the recorded size
    pub size_matches: bool,
    /// On-disk SHA-256 equals the recorded checksum
    pub checksum_matches: bool,
    /// All of the above
    pub verified: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PayloadHeader {
    format: String,
    tenant_id: TenantId,
    backup_type: BackupType,
    created_at: DateTime<Utc>,
    since: Option<DateTime<Utc>>,
    tables: Vec<String>,
    rows: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct PayloadRow {
    table: String,
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// base64
    Blob(String),
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Integer(i) => Self::Integer(i),
            Value::Real(f) => Self::Real(f),
            Value::Text(s) => Self::Text(s),
            Value::Blob(b) => Self::Blob(STANDARD.encode(b)),
        }
    }
}

impl SqlValue {
    fn into_value(self) -> TenancyResult<Value> {
        Ok(match self {
            Self::Null => Value::Null,
            Self::Integer(i) => Value::Integer(i),
            Self::Real(f) => Value::Real(f),
            Self::Text(s) => Value::Text(s),
            Self::Blob(b) => Value::Blob(
                STANDARD
                    .decode(b)
                    .map_err(|e| TenancyError::Integrity(format!("corrupt blob in backup: {e}")))?,
            ),
        })
    }
}

/// Tenant-isolated backup manager
pub struct BackupIsolationManager {
    db: Database,
    backup_dir: PathBuf,
    encryption: Option<Arc<EncryptionManager>>,
    audit: Arc<AuditLogManager>,
    default_retention_days: AtomicU32,
}

impl BackupIsolationManager {
    /// `encryption` set means every new artifact is sealed
    pub fn new(
        db: Database,
        backup_dir: impl Into<PathBuf>,
        encryption: Option<Arc<EncryptionManager>>,
        audit: Arc<AuditLogManager>,
        default_retention_days: u32,
    ) -> Self {
        Self {
            db,
            backup_dir: backup_dir.into(),
            encryption,
            audit,
            default_retention_days: AtomicU32::new(default_retention_days),
        }
    }

    /// Root under which `tenant_<id>` directories live
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Retention applied to new backups
    pub fn default_retention_days(&self) -> u32 {
        self.default_retention_days.load(Ordering::Relaxed)
    }

    /// Retention applied to backups created from now on
    pub fn set_default_retention_days(&self, days: u32) -> TenancyResult<()> {
        if days == 0 {
            return Err(TenancyError::Validation("retention must be at least one day".into()));
        }
        self.default_retention_days.store(days, Ordering::Relaxed);
        info!(days, "Default backup retention changed");
        Ok(())
    }

    fn tenant_dir(&self, tenant_id: TenantId) -> PathBuf {
        self.backup_dir.join(format!("tenant_{tenant_id}"))
    }

    /// Back up every isolated table of `tenant_id`
    pub async fn create_tenant_backup(
        &self,
        tenant_id: TenantId,
        backup_type: BackupType,
    ) -> TenancyResult<BackupRecord> {
        let start = Utc::now();
        let retention_days = self.default_retention_days();
        let dir = self.tenant_dir(tenant_id);
        let location = dir.join(format!(
            "backup_{}_{}_{}.bak",
            start.timestamp(),
            backup_type,
            &Uuid::new_v4().simple().to_string()[..8]
        ));
        let encrypted = self.encryption.is_some();

        let backup_id = self.db.with_tenant(tenant_id, |tx| {
            tx.execute(
                "INSERT INTO backup_records
                 (tenant_id, backup_type, status, start_time, size, location, retention_days, encrypted)
                 VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?5, ?6)",
                params![
                    tenant_id,
                    backup_type.as_str(),
                    to_millis(start),
                    location.to_string_lossy().into_owned(),
                    retention_days,
                    encrypted
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        info!(tenant_id, backup_id, %backup_type, "Backup started");

        match self
            .perform_backup(tenant_id, backup_id, backup_type, &dir, &location)
            .await
        {
            Ok(()) => {
                let record = self.get_backup(tenant_id, backup_id)?;
                metrics::counter!("backups_completed_total").increment(1);
                info!(tenant_id, backup_id, size = record.size, "Backup complete");
                self.audit
                    .record(
                        AuditLogEntry::new(tenant_id, SYSTEM_USER_ID, "backup_created")
                            .resource("backup", backup_id.to_string())
                            .details(format!("type: {backup_type}, size: {} bytes", record.size)),
                    )
                    .await;
                Ok(record)
            }
            Err(e) => {
                error!(tenant_id, backup_id, error = %e, "Backup failed");
                metrics::counter!("backups_failed_total").increment(1);
                let _ = tokio::fs::remove_file(partial_path(&location)).await;
                if let Err(mark) = self.mark_failed(tenant_id, backup_id, &e.to_string()) {
                    error!(tenant_id, backup_id, error = %mark, "Could not mark backup failed");
                }
                self.audit
                    .record(
                        AuditLogEntry::new(tenant_id, SYSTEM_USER_ID, "backup_failed")
                            .resource("backup", backup_id.to_string())
                            .details(format!("type: {backup_type}"))
                            .failed(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn perform_backup(
        &self,
        tenant_id: TenantId,
        backup_id: i64,
        backup_type: BackupType,
        dir: &Path,
        location: &Path,
    ) -> TenancyResult<()> {
        let payload = self.db.with_tenant(tenant_id, |tx| {
            advance_status(tx, backup_id, BackupStatus::Pending, BackupStatus::Running)?;
            let since = baseline(tx, backup_type)?;
            build_payload(tx, backup_type, since)
        })?;

        let (contents, key_id) = match &self.encryption {
            Some(enc) => {
                let (sealed, key_id) = enc.encrypt_with_key_id(&payload)?;
                (sealed.into_bytes(), Some(key_id))
            }
            None => (payload.into_bytes(), None),
        };
        let checksum = hex::encode(Sha256::digest(&contents));

        create_private_dir(dir).await?;
        write_artifact(location, &contents).await?;
        let size = tokio::fs::metadata(location).await?.len();

        self.db.with_tenant(tenant_id, |tx| {
            advance_status(tx, backup_id, BackupStatus::Running, BackupStatus::Complete)?;
            tx.execute(
                "UPDATE backup_records
                 SET end_time = ?1, size = ?2, key_id = ?3, checksum = ?4
                 WHERE id = ?5 AND tenant_id = ?6",
                params![now_millis(), size as i64, key_id, checksum, backup_id, tenant_id],
            )?;
            Ok(())
        })
    }

    /// Move a pending or running record to failed. False if it was
    /// already terminal (or gone).
    fn mark_failed(&self, tenant_id: TenantId, backup_id: i64, message: &str) -> TenancyResult<bool> {
        self.db.with_tenant(tenant_id, |tx| {
            let changed = tx.execute(
                "UPDATE backup_records SET status = 'failed', end_time = ?1, error_message = ?2
                 WHERE id = ?3 AND tenant_id = ?4 AND status IN ('pending', 'running')",
                params![now_millis(), message, backup_id, tenant_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Restore `backup_id` into `tenant_id`'s tables. The backup must belong
    /// to the same tenant and be complete; encrypted artifacts must decrypt
    /// under the active key.
    pub async fn restore_tenant_backup(
        &self,
        tenant_id: TenantId,
        backup_id: i64,
    ) -> TenancyResult<RestoreSummary> {
        warn!(tenant_id, backup_id, "Starting restore");
        let result = self.restore_inner(tenant_id, backup_id).await;

        match &result {
            Ok(summary) => {
                info!(tenant_id, backup_id, rows = summary.rows_restored, "Restore complete");
                self.audit
                    .record(
                        AuditLogEntry::new(tenant_id, SYSTEM_USER_ID, "backup_restored")
                            .resource("backup", backup_id.to_string())
                            .details(format!("rows: {}", summary.rows_restored)),
                    )
                    .await;
            }
            Err(e) => {
                error!(tenant_id, backup_id, error = %e, "Restore failed");
                self.audit
                    .record(
                        AuditLogEntry::new(tenant_id, SYSTEM_USER_ID, "backup_restore_failed")
                            .resource("backup", backup_id.to_string())
                            .failed(e.to_string()),
                    )
                    .await;
            }
        }
        result
    }

    async fn restore_inner(&self, tenant_id: TenantId, backup_id: i64) -> TenancyResult<RestoreSummary> {
        let record = self.get_backup(tenant_id, backup_id)?;
        if record.status != BackupStatus::Complete {
            return Err(TenancyError::Validation(format!(
                "backup {backup_id} is {}, not complete",
                record.status
            )));
        }

        let raw = tokio::fs::read(&record.location).await?;
        if let Some(expected) = &record.checksum {
            if hex::encode(Sha256::digest(&raw)) != *expected {
                return Err(TenancyError::Integrity(format!(
                    "backup {backup_id} checksum mismatch"
                )));
            }
        }

        let text = String::from_utf8(raw)
            .map_err(|_| TenancyError::Integrity(format!("backup {backup_id} is not UTF-8")))?;
        let payload = if record.encrypted {
            let enc = self.encryption.as_ref().ok_or_else(|| {
                TenancyError::Configuration(format!(
                    "backup {backup_id} is encrypted but no key is loaded"
                ))
            })?;
            if let Some(sealed_by) = &record.key_id {
                let active = enc.key_id();
                if *sealed_by != active {
                    return Err(TenancyError::Integrity(format!(
                        "backup {backup_id} sealed under key {sealed_by}, active key is {active}"
                    )));
                }
            }
            enc.decrypt(text.trim())?
        } else {
            text
        };

        let (header, rows) = parse_payload(&payload)?;
        if header.tenant_id != tenant_id {
            return Err(TenancyError::IsolationViolation(format!(
                "backup {backup_id} holds data of tenant {}",
                header.tenant_id
            )));
        }

        let tables: Vec<String> = header.tables.clone();
        let rows_restored = self
            .db
            .with_tenant(tenant_id, |tx| replay_rows(tx, rows))?;

        Ok(RestoreSummary {
            backup_id,
            tenant_id,
            rows_restored,
            tables,
        })
    }

    /// A single record, visible only to its own tenant
    pub fn get_backup(&self, tenant_id: TenantId, backup_id: i64) -> TenancyResult<BackupRecord> {
        self.db.with_tenant(tenant_id, |tx| {
            tx.query_row(
                &format!(
                    "SELECT {BACKUP_COLUMNS} FROM backup_records_scoped
                     WHERE id = ?1 AND tenant_id = ?2"
                ),
                params![backup_id, tenant_id],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| TenancyError::NotFound(format!("backup {backup_id}")))
        })
    }

    /// Most recent backups of `tenant_id`
    pub fn list_tenant_backups(&self, tenant_id: TenantId) -> TenancyResult<Vec<BackupRecord>> {
        self.query_backups(tenant_id, None, LIST_LIMIT)
    }

    /// Backups of `tenant_id`, optionally in one status, newest first
    pub fn query_backups(
        &self,
        tenant_id: TenantId,
        status: Option<BackupStatus>,
        limit: i64,
    ) -> TenancyResult<Vec<BackupRecord>> {
        let query = FilterQuery::from("backup_records_scoped")
            .filter("tenant_id", Cmp::Eq, tenant_id)
            .filter_opt("status", Cmp::Eq, status.map(|s| s.as_str().to_string()))
            .order_by("start_time DESC, id DESC")
            .limit(limit);
        let (sql, args) = query.build_select(BACKUP_COLUMNS);
        self.db.with_tenant(tenant_id, |tx| {
            let mut stmt = tx.prepare(&sql)?;
            let records = stmt
                .query_map(params_from_iter(args.iter()), row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Counts by status, total size and retention settings
    pub fn get_backup_status(&self, tenant_id: TenantId) -> TenancyResult<BackupStatusSummary> {
        let (status_counts, total_size) = self.db.with_tenant(tenant_id, |tx| {
            let mut stmt = tx.prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(size), 0)
                 FROM backup_records_scoped WHERE tenant_id = ?1 GROUP BY status",
            )?;
            let mut counts = BTreeMap::new();
            let mut total: i64 = 0;
            let mut rows = stmt.query(params![tenant_id])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let size: i64 = row.get(2)?;
                counts.insert(status, count as u64);
                total += size;
            }
            Ok((counts, total as u64))
        })?;

        Ok(BackupStatusSummary {
            tenant_id,
            status_counts,
            total_size,
            default_retention_days: self.default_retention_days(),
            encryption_enabled: self.encryption.is_some(),
            generated_at: Utc::now(),
        })
    }

    /// Delete `tenant_id`'s backups older than their retention period
    pub async fn delete_expired_backups(&self, tenant_id: TenantId) -> TenancyResult<u64> {
        self.delete_expired_backups_at(tenant_id, Utc::now()).await
    }

    /// As [`delete_expired_backups`](Self::delete_expired_backups), evaluated at `now`.
    /// A record whose artifact cannot be removed is kept for the next sweep.
    pub async fn delete_expired_backups_at(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> TenancyResult<u64> {
        let expired: Vec<(i64, PathBuf)> = self.db.with_tenant(tenant_id, |tx| {
            let mut stmt = tx.prepare(
                "SELECT id, location FROM backup_records_scoped
                 WHERE tenant_id = ?1 AND (?2 - start_time) > retention_days * ?3",
            )?;
            let rows = stmt
                .query_map(params![tenant_id, to_millis(now), MILLIS_PER_DAY], |row| {
                    Ok((row.get::<_, i64>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut deleted = 0;
        for (backup_id, location) in expired {
            match tokio::fs::remove_file(&location).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(backup_id, path = %location.display(), "Expired artifact already gone");
                }
                Err(e) => {
                    warn!(backup_id, path = %location.display(), error = %e, "Could not remove expired artifact");
                    continue;
                }
            }

            self.db.with_tenant(tenant_id, |tx| {
                tx.execute(
                    "DELETE FROM backup_records WHERE id = ?1 AND tenant_id = ?2",
                    params![backup_id, tenant_id],
                )?;
                Ok(())
            })?;
            deleted += 1;
            metrics::counter!("backups_expired_total").increment(1);
            self.audit
                .record(
                    AuditLogEntry::new(tenant_id, SYSTEM_USER_ID, "backup_expired")
                        .resource("backup", backup_id.to_string()),
                )
                .await;
        }

        if deleted > 0 {
            info!(tenant_id, deleted, "Expired backups removed");
        }
        Ok(deleted)
    }

    /// Expire backups of every tenant
    pub async fn sweep_expired_backups(&self) -> TenancyResult<u64> {
        self.sweep_expired_backups_at(Utc::now()).await
    }

    /// As [`sweep_expired_backups`](Self::sweep_expired_backups), evaluated at `now`
    pub async fn sweep_expired_backups_at(&self, now: DateTime<Utc>) -> TenancyResult<u64> {
        let mut total = 0;
        for tenant_id in self.tenants_with_backups()? {
            match self.delete_expired_backups_at(tenant_id, now).await {
                Ok(n) => total += n,
                Err(e) => error!(tenant_id, error = %e, "Retention sweep failed for tenant"),
            }
        }
        Ok(total)
    }

    fn tenants_with_backups(&self) -> TenancyResult<Vec<TenantId>> {
        self.db.with_system(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT tenant_id FROM backup_records ORDER BY tenant_id")?;
            let tenants = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tenants)
        })
    }

    /// Check the artifact against the record and set `verified` to match.
    /// A missing, resized or altered artifact is an Integrity error, after
    /// the record is marked unverified and the failure audited.
    pub async fn verify_backup_integrity(
        &self,
        tenant_id: TenantId,
        backup_id: i64,
    ) -> TenancyResult<BackupVerification> {
        let record = self.get_backup(tenant_id, backup_id)?;
        if record.status != BackupStatus::Complete {
            return Err(TenancyError::Validation(format!(
                "backup {backup_id} is {}, not complete",
                record.status
            )));
        }

        let (artifact_present, size_matches, checksum_matches) =
            match tokio::fs::read(&record.location).await {
                Ok(raw) => (
                    true,
                    raw.len() as u64 == record.size,
                    record
                        .checksum
                        .as_deref()
                        .map_or(true, |expected| hex::encode(Sha256::digest(&raw)) == expected),
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (false, false, false),
                Err(e) => return Err(e.into()),
            };
        let verified = artifact_present && size_matches && checksum_matches;

        self.db.with_tenant(tenant_id, |tx| {
            tx.execute(
                "UPDATE backup_records SET verified = ?1 WHERE id = ?2 AND tenant_id = ?3",
                params![verified, backup_id, tenant_id],
            )?;
            Ok(())
        })?;

        if !verified {
            let reason = if !artifact_present {
                "artifact missing"
            } else if !size_matches {
                "artifact size does not match record"
            } else {
                "artifact checksum does not match record"
            };
            warn!(tenant_id, backup_id, artifact_present, size_matches, checksum_matches, "Backup failed verification");
            self.audit
                .record(
                    AuditLogEntry::new(tenant_id, SYSTEM_USER_ID, "backup_verify_failed")
                        .resource("backup", backup_id.to_string())
                        .failed(reason),
                )
                .await;
            return Err(TenancyError::Integrity(format!("backup {backup_id}: {reason}")));
        }

        debug!(tenant_id, backup_id, "Backup verified");
        Ok(BackupVerification {
            backup_id,
            artifact_present,
            size_matches,
            checksum_matches,
            verified,
        })
    }

    /// Fail pending/running records started more than `older_than` ago
    pub async fn reconcile_stale_backups(&self, older_than: ChronoDuration) -> TenancyResult<u64> {
        self.reconcile_stale_backups_at(Utc::now(), older_than).await
    }

    /// As [`reconcile_stale_backups`](Self::reconcile_stale_backups), evaluated at `now`
    pub async fn reconcile_stale_backups_at(
        &self,
        now: DateTime<Utc>,
        older_than: ChronoDuration,
    ) -> TenancyResult<u64> {
        let cutoff = to_millis(now - older_than);
        let stale: Vec<(i64, TenantId)> = self.db.with_system(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id FROM backup_records
                 WHERE status IN ('pending', 'running') AND start_time < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut reconciled = 0;
        for (backup_id, tenant_id) in stale {
            if !self.mark_failed(tenant_id, backup_id, "abandoned before completion")? {
                continue;
            }
            reconciled += 1;
            metrics::counter!("backups_failed_total").increment(1);
            warn!(tenant_id, backup_id, "Stale backup marked failed");
            self.audit
                .record(
                    AuditLogEntry::new(tenant_id, SYSTEM_USER_ID, "backup_failed")
                        .resource("backup", backup_id.to_string())
                        .failed("abandoned before completion"),
                )
                .await;
        }
        Ok(reconciled)
    }
}

fn advance_status(
    tx: &TenantTx<'_>,
    backup_id: i64,
    from: BackupStatus,
    to: BackupStatus,
) -> TenancyResult<()> {
    if !from.can_advance_to(to) {
        return Err(TenancyError::Validation(format!(
            "illegal backup transition {from} -> {to}"
        )));
    }
    let changed = tx.execute(
        "UPDATE backup_records SET status = ?1 WHERE id = ?2 AND tenant_id = ?3 AND status = ?4",
        params![to.as_str(), backup_id, tx.tenant_id(), from.as_str()],
    )?;
    if changed == 0 {
        return Err(TenancyError::Integrity(format!(
            "backup {backup_id} is no longer {from}"
        )));
    }
    Ok(())
}

/// Start of the change window for non-full backups
fn baseline(tx: &TenantTx<'_>, backup_type: BackupType) -> TenancyResult<Option<i64>> {
    let sql = match backup_type {
        BackupType::Full => return Ok(None),
        BackupType::Incremental => {
            "SELECT MAX(start_time) FROM backup_records_scoped
             WHERE tenant_id = ?1 AND status = 'complete'"
        }
        BackupType::Differential => {
            "SELECT MAX(start_time) FROM backup_records_scoped
             WHERE tenant_id = ?1 AND status = 'complete' AND backup_type = 'full'"
        }
    };
    Ok(tx.query_row(sql, params![tx.tenant_id()], |row| row.get(0))?)
}

/// Header line followed by one line per row. Tables without an
/// `updated_at` column are always dumped in full.
fn build_payload(tx: &TenantTx<'_>, backup_type: BackupType, since: Option<i64>) -> TenancyResult<String> {
    let tenant_id = tx.tenant_id();
    let tables = tx.tenant_tables()?;
    let mut lines = Vec::new();

    for table in &tables {
        let columns = table_columns(tx, table)?;
        for column in &columns {
            validate_identifier(column)?;
        }
        let changed_only = since.is_some() && columns.iter().any(|c| c == "updated_at");
        let sql = format!(
            "SELECT {} FROM {table}_scoped WHERE tenant_id = ?1{}",
            columns.join(", "),
            if changed_only { " AND updated_at >= ?2" } else { "" }
        );

        let mut stmt = tx.prepare(&sql)?;
        let mut rows = if changed_only {
            stmt.query(params![tenant_id, since])?
        } else {
            stmt.query(params![tenant_id])?
        };
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|i| row.get::<_, Value>(i).map(SqlValue::from))
                .collect::<Result<Vec<_>, _>>()?;
            let line = PayloadRow {
                table: table.clone(),
                columns: columns.clone(),
                values,
            };
            lines.push(
                serde_json::to_string(&line)
                    .map_err(|e| TenancyError::Persistence(e.to_string()))?,
            );
        }
    }

    let header = PayloadHeader {
        format: PAYLOAD_FORMAT.to_string(),
        tenant_id,
        backup_type,
        created_at: Utc::now(),
        since: since.map(from_millis),
        tables,
        rows: lines.len(),
    };
    let mut payload =
        serde_json::to_string(&header).map_err(|e| TenancyError::Persistence(e.to_string()))?;
    for line in lines {
        payload.push('\n');
        payload.push_str(&line);
    }
    debug!(tenant_id, rows = header.rows, %backup_type, "Backup payload built");
    Ok(payload)
}

fn parse_payload(payload: &str) -> TenancyResult<(PayloadHeader, Vec<PayloadRow>)> {
    let corrupt = |e: serde_json::Error| TenancyError::Integrity(format!("corrupt backup payload: {e}"));
    let mut lines = payload.lines();

    let header: PayloadHeader = serde_json::from_str(
        lines
            .next()
            .ok_or_else(|| TenancyError::Integrity("empty backup payload".into()))?,
    )
    .map_err(corrupt)?;
    if header.format != PAYLOAD_FORMAT {
        return Err(TenancyError::Integrity(format!(
            "unsupported backup format {:?}",
            header.format
        )));
    }

    let rows = lines
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str::<PayloadRow>(line).map_err(corrupt))
        .collect::<TenancyResult<Vec<_>>>()?;
    if rows.len() != header.rows {
        return Err(TenancyError::Integrity(format!(
            "backup payload truncated: {} of {} rows",
            rows.len(),
            header.rows
        )));
    }
    Ok((header, rows))
}

/// Upsert rows into the bound tenant's tables. Any row that names an
/// unisolated table or another tenant aborts the whole restore.
fn replay_rows(tx: &TenantTx<'_>, rows: Vec<PayloadRow>) -> TenancyResult<u64> {
    let tenant_id = tx.tenant_id();
    let isolated: BTreeSet<String> = tx.tenant_tables()?.into_iter().collect();
    let mut restored = 0;

    for row in rows {
        if !isolated.contains(&row.table) {
            return Err(TenancyError::IsolationViolation(format!(
                "table {} is not tenant-isolated",
                row.table
            )));
        }
        validate_identifier(&row.table)?;
        for column in &row.columns {
            validate_identifier(column)?;
        }
        if row.columns.len() != row.values.len() {
            return Err(TenancyError::Integrity(format!(
                "row for {} has {} columns and {} values",
                row.table,
                row.columns.len(),
                row.values.len()
            )));
        }

        let owner = row
            .columns
            .iter()
            .position(|c| c == "tenant_id")
            .and_then(|i| row.values.get(i));
        if owner != Some(&SqlValue::Integer(tenant_id)) {
            return Err(TenancyError::IsolationViolation(format!(
                "row in {} does not belong to tenant {tenant_id}",
                row.table
            )));
        }

        let placeholders: Vec<String> = (1..=row.columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            row.table,
            row.columns.join(", "),
            placeholders.join(", ")
        );
        let values = row
            .values
            .into_iter()
            .map(SqlValue::into_value)
            .collect::<TenancyResult<Vec<_>>>()?;
        tx.execute(&sql, params_from_iter(values))?;
        restored += 1;
    }
    Ok(restored)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let backup_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let end_time: Option<i64> = row.get(5)?;
    let size: i64 = row.get(6)?;
    let location: String = row.get(7)?;

    Ok(BackupRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        backup_type: BackupType::parse(&backup_type)
            .ok_or_else(|| conversion_error(2, format!("unknown backup type {backup_type:?}")))?,
        status: BackupStatus::parse(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown backup status {status:?}")))?,
        start_time: from_millis(row.get(4)?),
        end_time: end_time.map(from_millis),
        size: size.max(0) as u64,
        location: PathBuf::from(location),
        retention_days: row.get(8)?,
        verified: row.get(9)?,
        encrypted: row.get(10)?,
        key_id: row.get(11)?,
        checksum: row.get(12)?,
        error_message: row.get(13)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn partial_path(location: &Path) -> PathBuf {
    location.with_extension("partial")
}

async fn create_private_dir(dir: &Path) -> TenancyResult<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await?;
    Ok(())
}

/// Write to a side file and rename, so a crash never leaves a truncated
/// artifact under the final name.
async fn write_artifact(location: &Path, contents: &[u8]) -> TenancyResult<()> {
    let partial = partial_path(location);
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&partial).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&partial, location).await?;
    Ok(())
}
