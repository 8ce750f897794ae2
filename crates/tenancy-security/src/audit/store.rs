//! Audit persistence, queries and chain verification

use super::entry::{AuditLogEntry, AuditStatus, GENESIS_HASH};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tenancy_common::{
    from_millis, to_millis, Cmp, Database, FilterQuery, TenancyError, TenancyResult, TenantId,
    UserId,
};

const COLUMNS: &str = "id, tenant_id, user_id, action, resource_type, resource_id, details, \
                       ip_address, user_agent, status, error_message, duration_ms, created_at, \
                       prev_hash, entry_hash";

/// Audit query filter. `tenant_id` is mandatory.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Tenant whose entries are read
    pub tenant_id: TenantId,
    /// Acting user
    pub user_id: Option<UserId>,
    /// Exact action name
    pub action: Option<String>,
    /// Exact resource type
    pub resource_type: Option<String>,
    /// Outcome
    pub status: Option<AuditStatus>,
    /// Inclusive lower bound on `created_at`
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub until: Option<DateTime<Utc>>,
    /// Page size
    pub limit: Option<i64>,
    /// Rows skipped before the page
    pub offset: Option<i64>,
}

impl AuditFilter {
    /// All entries of `tenant_id`
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            ..Default::default()
        }
    }

    /// Only entries by `user_id`
    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Only entries with this action
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Only entries on this resource type
    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Only entries with this outcome
    pub fn status(mut self, status: AuditStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Entries created at or after `since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Entries created at or before `until`
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// One page of `limit` rows after skipping `offset`
    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    fn to_query(&self) -> FilterQuery {
        let mut query = FilterQuery::from("audit_log")
            .filter("tenant_id", Cmp::Eq, self.tenant_id)
            .filter_opt("user_id", Cmp::Eq, self.user_id)
            .filter_opt("action", Cmp::Eq, self.action.clone())
            .filter_opt("resource_type", Cmp::Eq, self.resource_type.clone())
            .filter_opt("status", Cmp::Eq, self.status.map(|s| s.as_str().to_string()))
            .filter_opt("created_at", Cmp::Gte, self.since.map(to_millis))
            .filter_opt("created_at", Cmp::Lte, self.until.map(to_millis))
            .order_by("created_at DESC, id DESC");
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = self.offset {
            query = query.offset(offset);
        }
        query
    }
}

/// Hash chain verification result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    /// Tenant whose chain was walked
    pub tenant_id: TenantId,
    /// Every entry links to its predecessor and matches its hash
    pub valid: bool,
    /// Entries verified before the first break
    pub checked_count: usize,
    /// Id of the first entry that failed
    pub broken_at: Option<i64>,
    /// What failed at `broken_at`
    pub error: Option<String>,
}

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON array
    Json,
    /// Header row plus one row per entry
    Csv,
    /// ArcSight Common Event Format, one line per entry
    Cef,
}

/// Durable side of the audit log. Appends keep a per-tenant hash chain.
///
/// Chain heads are read inside the write transaction, so any number of
/// stores or processes may append to the same database.
#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    /// Store over `db`
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append `entries` in order, in one IMMEDIATE transaction
    pub fn append(&self, entries: &[AuditLogEntry]) -> TenancyResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.db.with_system(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut staged: HashMap<TenantId, String> = HashMap::new();

            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO audit_log
                     (tenant_id, user_id, action, resource_type, resource_id, details,
                      ip_address, user_agent, status, error_message, duration_ms, created_at,
                      prev_hash, entry_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )?;
                for entry in entries {
                    let prev_hash = match staged.get(&entry.tenant_id) {
                        Some(hash) => hash.clone(),
                        None => load_head(&tx, entry.tenant_id)?,
                    };
                    let entry_hash = entry.compute_hash(&prev_hash);
                    insert.execute(params![
                        entry.tenant_id,
                        entry.user_id,
                        entry.action,
                        entry.resource_type,
                        entry.resource_id,
                        entry.details,
                        entry.ip_address,
                        entry.user_agent,
                        entry.status.as_str(),
                        entry.error_message,
                        entry.duration_ms(),
                        to_millis(entry.created_at),
                        prev_hash,
                        entry_hash,
                    ])?;
                    staged.insert(entry.tenant_id, entry_hash);
                }
            }

            tx.commit()?;
            Ok(entries.len())
        })
    }

    /// Entries matching `filter`, newest first
    pub fn query(&self, filter: &AuditFilter) -> TenancyResult<Vec<AuditLogEntry>> {
        let (sql, args) = filter.to_query().build_select(COLUMNS);
        self.db.with_system(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params_from_iter(args.iter()), row_to_entry)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Number of entries matching `filter`, ignoring paging
    pub fn count(&self, filter: &AuditFilter) -> TenancyResult<u64> {
        let (sql, args) = filter.to_query().build_count();
        self.db.with_system(|conn| {
            let n: i64 = conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    /// Walk the tenant's chain oldest to newest
    pub fn verify_chain(&self, tenant_id: TenantId) -> TenancyResult<ChainVerification> {
        self.db.with_system(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM audit_log WHERE tenant_id = ?1 ORDER BY id ASC"
            ))?;
            let mut rows = stmt.query(params![tenant_id])?;

            let mut expected_prev = GENESIS_HASH.to_string();
            let mut checked_count = 0;
            while let Some(row) = rows.next()? {
                let entry = row_to_entry(row)?;
                let id = entry.id.unwrap_or_default();
                let stored_prev = entry.prev_hash.clone().unwrap_or_default();
                let stored_hash = entry.entry_hash.clone().unwrap_or_default();

                let error = if stored_prev != expected_prev {
                    Some(format!("hash chain broken at entry {id}"))
                } else if entry.compute_hash(&stored_prev) != stored_hash {
                    Some(format!("entry {id} hash mismatch"))
                } else {
                    None
                };
                if let Some(error) = error {
                    return Ok(ChainVerification {
                        tenant_id,
                        valid: false,
                        checked_count,
                        broken_at: Some(id),
                        error: Some(error),
                    });
                }

                expected_prev = stored_hash;
                checked_count += 1;
            }

            Ok(ChainVerification {
                tenant_id,
                valid: true,
                checked_count,
                broken_at: None,
                error: None,
            })
        })
    }

    /// Render a tenant's entries, oldest first
    pub fn export(&self, tenant_id: TenantId, format: ExportFormat) -> TenancyResult<String> {
        let mut entries = self.query(&AuditFilter::tenant(tenant_id))?;
        entries.reverse();

        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&entries)
                .map_err(|e| TenancyError::Persistence(e.to_string())),
            ExportFormat::Csv => {
                let mut csv = String::from(
                    "id,tenant_id,user_id,action,resource_type,resource_id,status,error_message,created_at,entry_hash\n",
                );
                for e in &entries {
                    let fields = [
                        e.id.unwrap_or_default().to_string(),
                        e.tenant_id.to_string(),
                        e.user_id.to_string(),
                        csv_field(&e.action),
                        csv_field(&e.resource_type),
                        csv_field(&e.resource_id),
                        e.status.to_string(),
                        csv_field(&e.error_message),
                        e.created_at.to_rfc3339(),
                        e.entry_hash.clone().unwrap_or_default(),
                    ];
                    csv.push_str(&fields.join(","));
                    csv.push('\n');
                }
                Ok(csv)
            }
            ExportFormat::Cef => {
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| {
                        let severity = match e.status {
                            AuditStatus::Success => 3,
                            AuditStatus::Failure => 7,
                        };
                        format!(
                            "CEF:0|OpenTenancy|audit|1.0|{}|{}|{}|rt={} cs1Label=tenant cs1={} suser={} outcome={} msg={}",
                            cef_header(&e.action),
                            cef_header(&e.action),
                            severity,
                            to_millis(e.created_at),
                            e.tenant_id,
                            e.user_id,
                            e.status,
                            cef_extension(&e.details),
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
        }
    }
}

fn load_head(conn: &Connection, tenant_id: TenantId) -> TenancyResult<String> {
    let head: Option<String> = conn
        .query_row(
            "SELECT entry_hash FROM audit_log WHERE tenant_id = ?1 ORDER BY id DESC LIMIT 1",
            params![tenant_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(head.unwrap_or_else(|| GENESIS_HASH.to_string()))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let status: String = row.get(9)?;
    let status = AuditStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            Type::Text,
            format!("unknown audit status {status:?}").into(),
        )
    })?;
    let duration_ms: i64 = row.get(11)?;

    Ok(AuditLogEntry {
        id: Some(row.get(0)?),
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        action: row.get(3)?,
        resource_type: row.get(4)?,
        resource_id: row.get(5)?,
        details: row.get(6)?,
        ip_address: row.get(7)?,
        user_agent: row.get(8)?,
        status,
        error_message: row.get(10)?,
        duration: Duration::from_millis(duration_ms.max(0) as u64),
        created_at: from_millis(row.get(12)?),
        prev_hash: Some(row.get(13)?),
        entry_hash: Some(row.get(14)?),
    })
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn cef_header(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|")
}

fn cef_extension(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AuditStore {
        AuditStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_append_builds_chain_per_tenant() {
        let store = store();
        store
            .append(&[
                AuditLogEntry::new(7, 1, "login"),
                AuditLogEntry::new(8, 2, "login"),
                AuditLogEntry::new(7, 1, "update_order"),
            ])
            .unwrap();

        let mut entries = store.query(&AuditFilter::tenant(7)).unwrap();
        entries.reverse();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].prev_hash.as_deref(), Some(GENESIS_HASH));
        assert_eq!(entries[1].prev_hash, entries[0].entry_hash);

        let other = store.query(&AuditFilter::tenant(8)).unwrap();
        assert_eq!(other[0].prev_hash.as_deref(), Some(GENESIS_HASH));

        assert!(store.verify_chain(7).unwrap().valid);
        assert_eq!(store.verify_chain(7).unwrap().checked_count, 2);
    }

    #[test]
    fn test_chain_continues_across_store_instances() {
        let db = Database::open_in_memory().unwrap();
        AuditStore::new(db.clone())
            .append(&[AuditLogEntry::new(7, 1, "a")])
            .unwrap();
        let fresh = AuditStore::new(db);
        fresh.append(&[AuditLogEntry::new(7, 1, "b")]).unwrap();
        let result = fresh.verify_chain(7).unwrap();
        assert!(result.valid);
        assert_eq!(result.checked_count, 2);
    }

    #[test]
    fn test_interleaved_writers_share_one_chain() {
        let db = Database::open_in_memory().unwrap();
        let first = AuditStore::new(db.clone());
        let second = AuditStore::new(db);

        first.append(&[AuditLogEntry::new(7, 1, "a1")]).unwrap();
        second.append(&[AuditLogEntry::new(7, 2, "b1")]).unwrap();
        first.append(&[AuditLogEntry::new(7, 1, "a2")]).unwrap();

        for store in [&first, &second] {
            let result = store.verify_chain(7).unwrap();
            assert!(result.valid, "{:?}", result.error);
            assert_eq!(result.checked_count, 3);
        }

        let mut entries = first.query(&AuditFilter::tenant(7)).unwrap();
        entries.reverse();
        assert_eq!(entries[2].action, "a2");
        assert_eq!(entries[2].prev_hash, entries[1].entry_hash);
    }

    #[test]
    fn test_audit_rows_are_append_only() {
        let db = Database::open_in_memory().unwrap();
        let store = AuditStore::new(db.clone());
        store.append(&[AuditLogEntry::new(7, 1, "login")]).unwrap();

        let update = db.with_system(|conn| {
            conn.execute("UPDATE audit_log SET details = 'edited'", [])?;
            Ok(())
        });
        assert!(update.is_err());
        let delete = db.with_system(|conn| {
            conn.execute("DELETE FROM audit_log", [])?;
            Ok(())
        });
        assert!(delete.is_err());
    }

    #[test]
    fn test_tampering_detected() {
        let db = Database::open_in_memory().unwrap();
        let store = AuditStore::new(db.clone());
        store
            .append(&[
                AuditLogEntry::new(7, 1, "a"),
                AuditLogEntry::new(7, 1, "b"),
                AuditLogEntry::new(7, 1, "c"),
            ])
            .unwrap();

        let target: i64 = db
            .with_system(|conn| {
                conn.execute_batch("DROP TRIGGER audit_log_no_update;")?;
                let id: i64 = conn.query_row(
                    "SELECT id FROM audit_log WHERE action = 'b'",
                    [],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "UPDATE audit_log SET details = 'rewritten' WHERE id = ?1",
                    params![id],
                )?;
                Ok(id)
            })
            .unwrap();

        let result = store.verify_chain(7).unwrap();
        assert!(!result.valid);
        assert_eq!(result.checked_count, 1);
        assert_eq!(result.broken_at, Some(target));
    }

    #[test]
    fn test_filter_and_count() {
        let store = store();
        store
            .append(&[
                AuditLogEntry::new(7, 1, "login"),
                AuditLogEntry::new(7, 2, "login").failed("bad password"),
                AuditLogEntry::new(7, 2, "export").resource("report", "r1"),
                AuditLogEntry::new(8, 3, "login").failed("bad password"),
            ])
            .unwrap();

        let failed = store
            .query(&AuditFilter::tenant(7).status(AuditStatus::Failure))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].user_id, 2);

        let filter = AuditFilter::tenant(7).user(2);
        assert_eq!(store.count(&filter).unwrap(), 2);
        assert_eq!(store.query(&filter.clone().page(1, 1)).unwrap().len(), 1);
        assert_eq!(store.count(&filter.page(1, 1)).unwrap(), 2);

        assert_eq!(
            store
                .count(&AuditFilter::tenant(7).action("login").resource_type(""))
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_export_formats() {
        let store = store();
        store
            .append(&[
                AuditLogEntry::new(7, 1, "login").details("from office, floor 2"),
                AuditLogEntry::new(7, 1, "logout"),
            ])
            .unwrap();

        let json = store.export(7, ExportFormat::Json).unwrap();
        let parsed: Vec<AuditLogEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].action, "login");

        let csv = store.export(7, ExportFormat::Csv).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().nth(1).unwrap().contains(",login,"));

        let cef = store.export(7, ExportFormat::Cef).unwrap();
        assert!(cef.starts_with("CEF:0|OpenTenancy|audit|1.0|login|"));
        assert!(cef.contains("msg=from office, floor 2"));
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
