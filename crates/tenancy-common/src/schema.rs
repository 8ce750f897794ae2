//! Schema migrations and the storage-layer row policy

use crate::error::{TenancyError, TenancyResult, ISOLATION_ABORT};
use rusqlite::{params, Connection, OptionalExtension};

/// System tables: schema, audit trail and backup bookkeeping.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_isolation_policies (
    table_name  TEXT PRIMARY KEY,
    enabled     INTEGER NOT NULL DEFAULT 1,
    system      INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id      INTEGER NOT NULL,
    user_id        INTEGER NOT NULL,
    action         TEXT NOT NULL,
    resource_type  TEXT NOT NULL DEFAULT '',
    resource_id    TEXT NOT NULL DEFAULT '',
    details        TEXT NOT NULL DEFAULT '',
    ip_address     TEXT NOT NULL DEFAULT '',
    user_agent     TEXT NOT NULL DEFAULT '',
    status         TEXT NOT NULL,
    error_message  TEXT NOT NULL DEFAULT '',
    duration_ms    INTEGER NOT NULL DEFAULT 0,
    created_at     INTEGER NOT NULL,
    prev_hash      TEXT NOT NULL,
    entry_hash     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_tenant_id ON audit_log(tenant_id);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
CREATE INDEX IF NOT EXISTS idx_audit_status ON audit_log(status);
CREATE INDEX IF NOT EXISTS idx_audit_created_at ON audit_log(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_audit_tenant_created ON audit_log(tenant_id, created_at DESC);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TABLE IF NOT EXISTS rls_audit_log (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id            INTEGER NOT NULL,
    user_id              INTEGER NOT NULL DEFAULT 0,
    action               TEXT NOT NULL,
    table_name           TEXT NOT NULL DEFAULT '',
    attempted_tenant_id  INTEGER NOT NULL DEFAULT 0,
    created_at           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rls_audit_tenant ON rls_audit_log(tenant_id, created_at DESC);

CREATE TABLE IF NOT EXISTS rls_violation_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id       INTEGER NOT NULL,
    user_id         INTEGER NOT NULL DEFAULT 0,
    operation       TEXT NOT NULL,
    table_name      TEXT NOT NULL,
    violation_time  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rls_violation_tenant ON rls_violation_log(tenant_id, violation_time DESC);

CREATE TABLE IF NOT EXISTS backup_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id       INTEGER NOT NULL,
    backup_type     TEXT NOT NULL,
    status          TEXT NOT NULL,
    start_time      INTEGER NOT NULL,
    end_time        INTEGER,
    size            INTEGER NOT NULL DEFAULT 0,
    location        TEXT NOT NULL,
    retention_days  INTEGER NOT NULL,
    verified        INTEGER NOT NULL DEFAULT 0,
    encrypted       INTEGER NOT NULL DEFAULT 0,
    key_id          TEXT,
    checksum        TEXT,
    error_message   TEXT
);
CREATE INDEX IF NOT EXISTS idx_backup_tenant ON backup_records(tenant_id, start_time DESC);

CREATE TRIGGER IF NOT EXISTS backup_records_forward_only
BEFORE UPDATE OF status ON backup_records
WHEN NEW.status <> OLD.status AND NOT (
    (OLD.status = 'pending' AND NEW.status IN ('running', 'failed')) OR
    (OLD.status = 'running' AND NEW.status IN ('complete', 'failed'))
)
BEGIN
    SELECT RAISE(ABORT, 'backup status may only advance');
END;
"#;

/// Tables whose rows belong to the platform rather than to tenant data sets.
/// They carry the row policy but are never part of a tenant backup.
pub(crate) const SYSTEM_ISOLATED_TABLES: &[&str] = &["backup_records"];

/// Isolation state of a single table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationStatus {
    /// Table exists in the main schema
    pub table_exists: bool,
    /// Table has a policy row with `enabled = 1`
    pub registered: bool,
    /// All three row-policy triggers are present
    pub triggers_installed: bool,
}

impl IsolationStatus {
    /// Policy is present and enforced
    pub fn is_enforced(&self) -> bool {
        self.table_exists && self.registered && self.triggers_installed
    }
}

pub(crate) fn migrate(conn: &Connection) -> TenancyResult<()> {
    conn.execute_batch(SCHEMA)?;
    for table in SYSTEM_ISOLATED_TABLES {
        install_isolation(conn, table, true)?;
    }
    Ok(())
}

/// Reject anything that is not a plain SQL identifier. Table names end up
/// interpolated into DDL, so this is the only gate against injection.
pub fn validate_identifier(name: &str) -> TenancyResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 64 {
        Ok(())
    } else {
        Err(TenancyError::Configuration(format!("invalid table name: {name:?}")))
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> TenancyResult<bool> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

/// Column names of `table`, in declaration order
pub fn table_columns(conn: &Connection, table: &str) -> TenancyResult<Vec<String>> {
    validate_identifier(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn trigger_names(table: &str) -> [String; 3] {
    [
        format!("{table}_tenant_insert"),
        format!("{table}_tenant_update"),
        format!("{table}_tenant_delete"),
    ]
}

pub(crate) fn install_isolation(conn: &Connection, table: &str, system: bool) -> TenancyResult<()> {
    validate_identifier(table)?;
    if !table_exists(conn, table)? {
        return Err(TenancyError::NotFound(format!("table {table}")));
    }
    if !table_columns(conn, table)?.iter().any(|c| c == "tenant_id") {
        return Err(TenancyError::Configuration(format!(
            "table {table} has no tenant_id column"
        )));
    }

    let [insert, update, delete] = trigger_names(table);
    conn.execute_batch(&format!(
        r#"
        CREATE TRIGGER IF NOT EXISTS {insert}
        BEFORE INSERT ON {table}
        WHEN NEW.tenant_id IS NOT current_tenant_id()
        BEGIN
            SELECT RAISE(ABORT, '{ISOLATION_ABORT}: {table}');
        END;

        CREATE TRIGGER IF NOT EXISTS {update}
        BEFORE UPDATE ON {table}
        WHEN OLD.tenant_id IS NOT current_tenant_id()
          OR NEW.tenant_id IS NOT current_tenant_id()
        BEGIN
            SELECT RAISE(ABORT, '{ISOLATION_ABORT}: {table}');
        END;

        CREATE TRIGGER IF NOT EXISTS {delete}
        BEFORE DELETE ON {table}
        WHEN OLD.tenant_id IS NOT current_tenant_id()
        BEGIN
            SELECT RAISE(ABORT, '{ISOLATION_ABORT}: {table}');
        END;

        CREATE VIEW IF NOT EXISTS {table}_scoped AS
            SELECT * FROM {table} WHERE tenant_id = current_tenant_id();
        "#
    ))?;

    conn.execute(
        "INSERT INTO tenant_isolation_policies (table_name, enabled, system, created_at)
         VALUES (?1, 1, ?2, ?3)
         ON CONFLICT(table_name) DO UPDATE SET enabled = 1, system = excluded.system",
        params![table, system, crate::now_millis()],
    )?;
    tracing::info!(table, "Row isolation policy installed");
    Ok(())
}

pub(crate) fn remove_isolation(conn: &Connection, table: &str) -> TenancyResult<()> {
    validate_identifier(table)?;
    let [insert, update, delete] = trigger_names(table);
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {insert};
         DROP TRIGGER IF EXISTS {update};
         DROP TRIGGER IF EXISTS {delete};
         DROP VIEW IF EXISTS {table}_scoped;"
    ))?;
    conn.execute(
        "UPDATE tenant_isolation_policies SET enabled = 0 WHERE table_name = ?1",
        params![table],
    )?;
    tracing::warn!(table, "Row isolation policy removed");
    Ok(())
}

pub(crate) fn isolation_status(conn: &Connection, table: &str) -> TenancyResult<IsolationStatus> {
    validate_identifier(table)?;
    let table_exists = table_exists(conn, table)?;

    let registered: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM tenant_isolation_policies WHERE table_name = ?1 AND enabled = 1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;

    let [insert, update, delete] = trigger_names(table);
    let triggers: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE type = 'trigger' AND tbl_name = ?1 AND name IN (?2, ?3, ?4)",
        params![table, insert, update, delete],
        |row| row.get(0),
    )?;

    Ok(IsolationStatus {
        table_exists,
        registered: registered.is_some(),
        triggers_installed: triggers == 3,
    })
}

/// Tenant data tables covered by the row policy (system tables excluded)
pub(crate) fn tenant_tables(conn: &Connection) -> TenancyResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM tenant_isolation_policies
         WHERE enabled = 1 AND system = 0
         ORDER BY table_name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tables)
}
