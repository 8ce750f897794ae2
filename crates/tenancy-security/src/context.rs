//! Tenant Context (row-level isolation at the application layer)
//!
//! Storage enforcement lives in `tenancy_common`; this manager binds units of
//! work, checks tenant ownership before queries and records denials and
//! violations in the security logs.
//!
//! Denials and violations raised inside a unit of work cannot write the
//! security logs while that unit holds the connection. They are queued and
//! written by the next log call, log read or
//! [`TenantContextManager::flush_security_logs`] outside it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tenancy_common::{
    from_millis, now_millis, validate_identifier, Cmp, Database, FilterQuery, TenancyError,
    IsolationStatus, TenancyResult, TenantId, TenantTx, UserId,
};
use tracing::{debug, warn};

/// Cached per-user session context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    /// Tenant the user acts for
    pub tenant_id: TenantId,
    /// User
    pub user_id: UserId,
    /// Granted permissions
    pub permissions: HashSet<String>,
    /// When the context was cached
    pub set_time: DateTime<Utc>,
}

/// Operation being checked against a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TableOperation {
    /// Read
    Select,
    /// Create
    Insert,
    /// Modify
    Update,
    /// Remove
    Delete,
}

impl TableOperation {
    /// SQL keyword
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for TableOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row in the access-denial log
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    /// Row id
    pub id: i64,
    /// Tenant of the caller that was denied
    pub tenant_id: TenantId,
    /// Caller, 0 when unknown
    pub user_id: UserId,
    /// Event name, e.g. `access_denied`
    pub action: String,
    /// Table involved, empty for tenant-level checks
    pub table_name: String,
    /// Tenant the caller tried to reach
    pub attempted_tenant_id: TenantId,
    /// When the event was raised
    pub created_at: DateTime<Utc>,
}

/// Row in the policy-violation log
#[derive(Debug, Clone, Serialize)]
pub struct ViolationRecord {
    /// Row id
    pub id: i64,
    /// Tenant the operation ran for
    pub tenant_id: TenantId,
    /// Caller, 0 when unknown
    pub user_id: UserId,
    /// SQL keyword of the rejected operation
    pub operation: String,
    /// Table without an enforced policy
    pub table_name: String,
    /// When the violation was raised
    pub violation_time: DateTime<Utc>,
}

/// Snapshot of a user's cached permissions
#[derive(Debug, Clone, Serialize)]
pub struct PermissionStatus {
    /// User asked about
    pub user_id: UserId,
    /// A context is cached for the user
    pub cached: bool,
    /// Cached tenant
    pub tenant_id: Option<TenantId>,
    /// Granted permissions, sorted
    pub permissions: Vec<String>,
    /// When the context was cached
    pub cached_at: Option<DateTime<Utc>>,
    /// Seconds since `cached_at`
    pub cache_age_secs: Option<i64>,
}

/// Security-log row waiting for the connection
#[derive(Debug, Clone)]
enum SecurityLogWrite {
    Event {
        tenant_id: TenantId,
        user_id: UserId,
        action: String,
        table_name: String,
        attempted_tenant_id: TenantId,
        at: i64,
    },
    Violation {
        tenant_id: TenantId,
        user_id: UserId,
        operation: TableOperation,
        table_name: String,
        at: i64,
    },
}

impl SecurityLogWrite {
    fn insert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        match self {
            Self::Event {
                tenant_id,
                user_id,
                action,
                table_name,
                attempted_tenant_id,
                at,
            } => conn.execute(
                "INSERT INTO rls_audit_log
                 (tenant_id, user_id, action, table_name, attempted_tenant_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![tenant_id, user_id, action, table_name, attempted_tenant_id, at],
            ),
            Self::Violation {
                tenant_id,
                user_id,
                operation,
                table_name,
                at,
            } => conn.execute(
                "INSERT INTO rls_violation_log
                 (tenant_id, user_id, operation, table_name, violation_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![tenant_id, user_id, operation.as_str(), table_name, at],
            ),
        }
    }
}

/// Tenant context manager
pub struct TenantContextManager {
    db: Database,
    contexts: RwLock<HashMap<UserId, TenantContext>>,
    strict_mode: AtomicBool,
    auditing_enabled: AtomicBool,
    pending: Mutex<Vec<SecurityLogWrite>>,
}

impl TenantContextManager {
    /// Strict mode and auditing on
    pub fn new(db: Database) -> Self {
        Self {
            db,
            contexts: RwLock::new(HashMap::new()),
            strict_mode: AtomicBool::new(true),
            auditing_enabled: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Toggle rejection of unprotected tables
    pub fn set_strict_mode(&self, enabled: bool) {
        self.strict_mode.store(enabled, Ordering::Relaxed);
        debug!(enabled, "Strict isolation mode changed");
    }

    /// Unprotected tables are rejected
    pub fn strict_mode(&self) -> bool {
        self.strict_mode.load(Ordering::Relaxed)
    }

    /// Toggle writes to the security logs
    pub fn set_auditing_enabled(&self, enabled: bool) {
        self.auditing_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Denials and violations are written to the security logs
    pub fn auditing_enabled(&self) -> bool {
        self.auditing_enabled.load(Ordering::Relaxed)
    }

    /// Bind `tenant_id` to the unit of work
    pub fn set_tenant_context(&self, tx: &mut TenantTx<'_>, tenant_id: TenantId) -> TenancyResult<()> {
        tx.rebind(tenant_id)?;
        debug!(tenant_id, "Tenant context bound");
        Ok(())
    }

    /// Tenant currently bound to the unit of work, read back from SQL
    pub fn get_tenant_id(&self, tx: &TenantTx<'_>) -> TenancyResult<TenantId> {
        tx.bound_tenant_id()
    }

    /// Allow only when the caller's tenant matches the requested tenant.
    /// Denials are logged to the security log; a failed log write never
    /// turns a denial into a grant.
    pub fn verify_tenant_access(&self, user_tenant_id: TenantId, requested_tenant_id: TenantId) -> bool {
        if user_tenant_id > 0 && user_tenant_id == requested_tenant_id {
            return true;
        }

        warn!(
            user_tenant = user_tenant_id,
            requested_tenant = requested_tenant_id,
            "Cross-tenant access denied"
        );
        metrics::counter!("tenant_access_denied_total").increment(1);
        if let Err(e) = self.log_security_event(
            user_tenant_id,
            0,
            "access_denied",
            "",
            requested_tenant_id,
        ) {
            warn!(error = %e, "Failed to record access denial");
        }
        false
    }

    /// Same check, resolving the caller's tenant from the session cache.
    /// An uncached user is denied.
    pub fn verify_user_access(&self, user_id: UserId, requested_tenant_id: TenantId) -> bool {
        let tenant = self.contexts.read().get(&user_id).map(|ctx| ctx.tenant_id);
        match tenant {
            Some(tenant_id) => self.verify_tenant_access(tenant_id, requested_tenant_id),
            None => {
                warn!(user_id, requested_tenant = requested_tenant_id, "No cached context, access denied");
                metrics::counter!("tenant_access_denied_total").increment(1);
                false
            }
        }
    }

    /// Confirm `table` exists and carries an enforced row policy before
    /// `operation` runs on it for `tenant_id`. Inside a unit of work use
    /// [`verify_table_access_in`](Self::verify_table_access_in).
    pub fn verify_table_access(
        &self,
        tenant_id: TenantId,
        table: &str,
        operation: TableOperation,
    ) -> TenancyResult<()> {
        let status = self.db.isolation_status(table)?;
        self.check_table_status(tenant_id, table, operation, status)
    }

    /// Same check from inside a unit of work, for the tenant it is bound to
    pub fn verify_table_access_in(
        &self,
        tx: &TenantTx<'_>,
        table: &str,
        operation: TableOperation,
    ) -> TenancyResult<()> {
        let status = tx.isolation_status(table)?;
        self.check_table_status(tx.tenant_id(), table, operation, status)
    }

    fn check_table_status(
        &self,
        tenant_id: TenantId,
        table: &str,
        operation: TableOperation,
        status: IsolationStatus,
    ) -> TenancyResult<()> {
        if !status.table_exists {
            return Err(TenancyError::NotFound(format!("table {table}")));
        }
        if status.is_enforced() {
            return Ok(());
        }

        warn!(tenant_id, table, %operation, "Table has no enforced isolation policy");
        if !self.strict_mode() {
            return Ok(());
        }
        if let Err(e) = self.log_violation(tenant_id, 0, operation, table) {
            warn!(error = %e, "Failed to record isolation violation");
        }
        Err(TenancyError::IsolationViolation(format!(
            "{operation} on {table}: row isolation not enforced"
        )))
    }

    /// Append to the access-denial log
    pub fn log_security_event(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        action: &str,
        table_name: &str,
        attempted_tenant_id: TenantId,
    ) -> TenancyResult<()> {
        self.enqueue(SecurityLogWrite::Event {
            tenant_id,
            user_id,
            action: action.to_string(),
            table_name: table_name.to_string(),
            attempted_tenant_id,
            at: now_millis(),
        })
    }

    /// Append to the policy-violation log
    pub fn log_violation(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        operation: TableOperation,
        table_name: &str,
    ) -> TenancyResult<()> {
        self.enqueue(SecurityLogWrite::Violation {
            tenant_id,
            user_id,
            operation,
            table_name: table_name.to_string(),
            at: now_millis(),
        })
    }

    /// Write queued security-log rows now. Returns how many were written.
    pub fn flush_security_logs(&self) -> TenancyResult<usize> {
        self.db.with_system(|conn| self.write_pending(conn))
    }

    /// Security-log rows still waiting for the connection
    pub fn pending_security_logs(&self) -> usize {
        self.pending.lock().len()
    }

    fn enqueue(&self, write: SecurityLogWrite) -> TenancyResult<()> {
        if !self.auditing_enabled() {
            return Ok(());
        }
        self.pending.lock().push(write);
        match self.db.try_with_system(|conn| self.write_pending(conn)) {
            Some(result) => result.map(|_| ()),
            None => {
                debug!("Security log write deferred until the unit of work ends");
                Ok(())
            }
        }
    }

    fn write_pending(&self, conn: &mut Connection) -> TenancyResult<usize> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        match insert_all(conn, &batch) {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                let mut pending = self.pending.lock();
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                Err(e)
            }
        }
    }

    /// Most recent access denials recorded against `tenant_id`
    pub fn security_events(&self, tenant_id: TenantId, limit: i64) -> TenancyResult<Vec<SecurityEvent>> {
        let query = FilterQuery::from("rls_audit_log")
            .filter("tenant_id", Cmp::Eq, tenant_id)
            .order_by("created_at DESC, id DESC")
            .limit(limit);
        let (sql, args) = query.build_select(
            "id, tenant_id, user_id, action, table_name, attempted_tenant_id, created_at",
        );
        self.db.with_system(|conn| {
            self.write_pending(conn)?;
            let mut stmt = conn.prepare(&sql)?;
            let events = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok(SecurityEvent {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        user_id: row.get(2)?,
                        action: row.get(3)?,
                        table_name: row.get(4)?,
                        attempted_tenant_id: row.get(5)?,
                        created_at: from_millis(row.get(6)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
    }

    /// Most recent violations recorded against `tenant_id`
    pub fn violations(&self, tenant_id: TenantId, limit: i64) -> TenancyResult<Vec<ViolationRecord>> {
        let query = FilterQuery::from("rls_violation_log")
            .filter("tenant_id", Cmp::Eq, tenant_id)
            .order_by("violation_time DESC, id DESC")
            .limit(limit);
        let (sql, args) =
            query.build_select("id, tenant_id, user_id, operation, table_name, violation_time");
        self.db.with_system(|conn| {
            self.write_pending(conn)?;
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok(ViolationRecord {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        user_id: row.get(2)?,
                        operation: row.get(3)?,
                        table_name: row.get(4)?,
                        violation_time: from_millis(row.get(5)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Bind `tenant_id` and confirm every row visible through the scoped
    /// view of `table` belongs to it. Returns the visible row count.
    pub fn verify_data_integrity(&self, tenant_id: TenantId, table: &str) -> TenancyResult<u64> {
        validate_identifier(table)?;
        let status = self.db.isolation_status(table)?;
        if !status.is_enforced() {
            return Err(TenancyError::IsolationViolation(format!(
                "row isolation not enforced on {table}"
            )));
        }

        self.db.with_tenant(tenant_id, |tx| {
            let (visible, foreign): (i64, i64) = tx.query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(tenant_id IS NOT ?1), 0) FROM {table}_scoped"
                ),
                params![tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if foreign > 0 {
                return Err(TenancyError::IsolationViolation(format!(
                    "{foreign} foreign rows visible in {table} for tenant {tenant_id}"
                )));
            }
            Ok(visible as u64)
        })
    }

    /// Cache a user's tenant and permissions
    pub fn set_user_permissions<I, S>(&self, user_id: UserId, tenant_id: TenantId, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let context = TenantContext {
            tenant_id,
            user_id,
            permissions: permissions.into_iter().map(Into::into).collect(),
            set_time: Utc::now(),
        };
        self.contexts.write().insert(user_id, context);
    }

    /// Cached context of `user_id`
    pub fn get_user_context(&self, user_id: UserId) -> Option<TenantContext> {
        self.contexts.read().get(&user_id).cloned()
    }

    /// Drop a user's cached context; true if one was cached
    pub fn clear_user_context(&self, user_id: UserId) -> bool {
        self.contexts.write().remove(&user_id).is_some()
    }

    /// Uncached users have no permissions
    pub fn has_permission(&self, user_id: UserId, permission: &str) -> bool {
        self.contexts
            .read()
            .get(&user_id)
            .is_some_and(|ctx| ctx.permissions.contains(permission))
    }

    /// What is cached for `user_id`, and how old it is
    pub fn permission_status(&self, user_id: UserId) -> PermissionStatus {
        match self.contexts.read().get(&user_id) {
            Some(ctx) => {
                let mut permissions: Vec<String> = ctx.permissions.iter().cloned().collect();
                permissions.sort();
                PermissionStatus {
                    user_id,
                    cached: true,
                    tenant_id: Some(ctx.tenant_id),
                    permissions,
                    cached_at: Some(ctx.set_time),
                    cache_age_secs: Some((Utc::now() - ctx.set_time).num_seconds()),
                }
            }
            None => PermissionStatus {
                user_id,
                cached: false,
                tenant_id: None,
                permissions: Vec::new(),
                cached_at: None,
                cache_age_secs: None,
            },
        }
    }

    /// Number of cached user contexts
    pub fn cached_users(&self) -> usize {
        self.contexts.read().len()
    }
}

fn insert_all(conn: &mut Connection, batch: &[SecurityLogWrite]) -> TenancyResult<()> {
    let tx = conn.transaction()?;
    for write in batch {
        write.insert(&tx)?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, TenantContextManager) {
        let db = Database::open_in_memory().unwrap();
        db.with_system(|conn| {
            conn.execute_batch(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, tenant_id INTEGER NOT NULL, item TEXT);
                 CREATE TABLE themes (id INTEGER PRIMARY KEY, tenant_id INTEGER NOT NULL);",
            )?;
            Ok(())
        })
        .unwrap();
        db.enable_isolation("orders").unwrap();
        let mgr = TenantContextManager::new(db.clone());
        (db, mgr)
    }

    #[test]
    fn test_verify_tenant_access() {
        let (_db, mgr) = setup();
        assert!(mgr.verify_tenant_access(7, 7));
        assert!(!mgr.verify_tenant_access(7, 8));
        assert!(!mgr.verify_tenant_access(0, 0));
        assert!(!mgr.verify_tenant_access(-1, -1));

        let events = mgr.security_events(7, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "access_denied");
        assert_eq!(events[0].attempted_tenant_id, 8);
    }

    #[test]
    fn test_denial_inside_unit_of_work_is_deferred() {
        let (db, mgr) = setup();
        let granted = db
            .with_tenant(7, |tx| {
                let granted = mgr.verify_tenant_access(7, 8);
                mgr.verify_table_access_in(tx, "orders", TableOperation::Select)?;
                let rejected = mgr.verify_table_access_in(tx, "themes", TableOperation::Update);
                assert!(matches!(rejected, Err(TenancyError::IsolationViolation(_))));
                Ok(granted)
            })
            .unwrap();
        assert!(!granted);
        assert_eq!(mgr.pending_security_logs(), 2);

        let events = mgr.security_events(7, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attempted_tenant_id, 8);
        let violations = mgr.violations(7, 10).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].table_name, "themes");
        assert_eq!(mgr.pending_security_logs(), 0);
    }

    #[test]
    fn test_denial_inside_unit_of_work_survives_rollback() {
        let (db, mgr) = setup();
        let result: TenancyResult<()> = db.with_tenant(7, |_| {
            mgr.verify_tenant_access(7, 8);
            Err(TenancyError::Validation("caller gave up".into()))
        });
        assert!(result.is_err());
        assert_eq!(mgr.flush_security_logs().unwrap(), 1);
        assert_eq!(mgr.flush_security_logs().unwrap(), 0);
        assert_eq!(mgr.security_events(7, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_table_check_inside_unit_of_work_never_blocks() {
        let (db, mgr) = setup();
        let nested = db.with_tenant(7, |_| {
            mgr.verify_table_access(7, "orders", TableOperation::Select)
        });
        assert!(matches!(nested, Err(TenancyError::Configuration(_))));
    }

    #[test]
    fn test_denial_not_logged_when_auditing_disabled() {
        let (_db, mgr) = setup();
        mgr.set_auditing_enabled(false);
        assert!(!mgr.verify_tenant_access(7, 8));
        assert!(mgr.security_events(7, 10).unwrap().is_empty());
    }

    #[test]
    fn test_verify_user_access_uses_cache() {
        let (_db, mgr) = setup();
        assert!(!mgr.verify_user_access(42, 7));
        mgr.set_user_permissions(42, 7, ["orders:read"]);
        assert!(mgr.verify_user_access(42, 7));
        assert!(!mgr.verify_user_access(42, 8));
    }

    #[test]
    fn test_bind_and_read_back() {
        let (db, mgr) = setup();
        db.with_tenant(7, |tx| {
            assert_eq!(mgr.get_tenant_id(tx)?, 7);
            mgr.set_tenant_context(tx, 9)?;
            assert_eq!(mgr.get_tenant_id(tx)?, 9);
            assert!(mgr.set_tenant_context(tx, 0).is_err());
            assert_eq!(mgr.get_tenant_id(tx)?, 9);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rebound_context_governs_writes() {
        let (db, mgr) = setup();
        let result = db.with_tenant(7, |tx| {
            mgr.set_tenant_context(tx, 8)?;
            tx.execute("INSERT INTO orders (tenant_id, item) VALUES (7, 'x')", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(TenancyError::IsolationViolation(_))));
    }

    #[test]
    fn test_verify_table_access_strict() {
        let (_db, mgr) = setup();
        assert!(mgr.verify_table_access(7, "orders", TableOperation::Select).is_ok());
        assert!(matches!(
            mgr.verify_table_access(7, "themes", TableOperation::Insert),
            Err(TenancyError::IsolationViolation(_))
        ));
        assert!(matches!(
            mgr.verify_table_access(7, "missing", TableOperation::Select),
            Err(TenancyError::NotFound(_))
        ));
        assert!(matches!(
            mgr.verify_table_access(7, "orders; --", TableOperation::Select),
            Err(TenancyError::Configuration(_))
        ));

        let violations = mgr.violations(7, 10).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].operation, "INSERT");
        assert_eq!(violations[0].table_name, "themes");
    }

    #[test]
    fn test_verify_table_access_lenient() {
        let (_db, mgr) = setup();
        mgr.set_strict_mode(false);
        assert!(mgr.verify_table_access(7, "themes", TableOperation::Update).is_ok());
        assert!(mgr.violations(7, 10).unwrap().is_empty());
    }

    #[test]
    fn test_disabled_policy_detected() {
        let (db, mgr) = setup();
        db.disable_isolation("orders").unwrap();
        assert!(mgr.verify_table_access(7, "orders", TableOperation::Delete).is_err());
        assert!(mgr.verify_data_integrity(7, "orders").is_err());
    }

    #[test]
    fn test_verify_data_integrity() {
        let (db, mgr) = setup();
        for (tenant, item) in [(7, "a"), (7, "b"), (8, "c")] {
            db.with_tenant(tenant, |tx| {
                tx.execute(
                    "INSERT INTO orders (tenant_id, item) VALUES (?1, ?2)",
                    params![tenant, item],
                )?;
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(mgr.verify_data_integrity(7, "orders").unwrap(), 2);
        assert_eq!(mgr.verify_data_integrity(8, "orders").unwrap(), 1);
        assert_eq!(mgr.verify_data_integrity(9, "orders").unwrap(), 0);
    }

    #[test]
    fn test_permission_cache() {
        let (_db, mgr) = setup();
        mgr.set_user_permissions(1, 7, ["orders:read", "orders:write"]);
        assert!(mgr.has_permission(1, "orders:write"));
        assert!(!mgr.has_permission(1, "admin"));
        assert!(!mgr.has_permission(2, "orders:read"));

        let status = mgr.permission_status(1);
        assert!(status.cached);
        assert_eq!(status.tenant_id, Some(7));
        assert_eq!(status.permissions, vec!["orders:read", "orders:write"]);

        assert!(mgr.clear_user_context(1));
        assert!(!mgr.clear_user_context(1));
        assert!(!mgr.permission_status(1).cached);
        assert_eq!(mgr.cached_users(), 0);
    }
}
