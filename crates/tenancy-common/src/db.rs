//! Database handle and the tenant-bound unit of work
//!
//! The tenant marker lives in the connection as the SQL function
//! `current_tenant_id()`. Row-policy triggers and `<table>_scoped` views read
//! it, so a write that names another tenant aborts inside SQLite even if the
//! application-layer check was skipped.
//!
//! The connection lock is not reentrant. Re-entering it from the thread that
//! holds it fails with a Configuration error instead of blocking forever;
//! [`Database::try_with_system`] lets callers defer work in that case.

use crate::error::{TenancyError, TenancyResult};
use crate::schema::{self, IsolationStatus};
use crate::TenantId;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::cell::RefCell;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Marker value when no tenant is bound. Never equal to a real tenant id.
pub const UNBOUND_TENANT: TenantId = 0;

static NEXT_DB_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Databases whose connection lock this thread currently holds
    static HELD: RefCell<Vec<u64>> = RefCell::new(Vec::new());
}

/// Shared database handle
#[derive(Clone)]
pub struct Database {
    id: u64,
    conn: Arc<Mutex<Connection>>,
    /// Tenant marker read by `current_tenant_id()`
    binding: Arc<AtomicI64>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("bound_tenant", &self.binding.load(Ordering::SeqCst))
            .finish()
    }
}

impl Database {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> TenancyResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        tracing::info!(path = %path.display(), "Opened tenancy database");
        Self::init(conn)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> TenancyResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> TenancyResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // REPLACE conflict deletes only fire the row-policy delete trigger
        // with recursive triggers on
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA recursive_triggers = ON;")?;

        let binding = Arc::new(AtomicI64::new(UNBOUND_TENANT));
        let marker = Arc::clone(&binding);
        conn.create_scalar_function(
            "current_tenant_id",
            0,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
            move |_ctx| Ok(marker.load(Ordering::SeqCst)),
        )?;

        schema::migrate(&conn)?;

        Ok(Self {
            id: NEXT_DB_ID.fetch_add(1, Ordering::Relaxed),
            conn: Arc::new(Mutex::new(conn)),
            binding,
        })
    }

    /// Run `f` as one transaction bound to `tenant_id`.
    ///
    /// The marker is reset on entry, bound for the transaction and cleared
    /// again before the connection is released, whatever `f` returns.
    /// Commits on `Ok`, rolls back on `Err`.
    pub fn with_tenant<T, F>(&self, tenant_id: TenantId, f: F) -> TenancyResult<T>
    where
        F: FnOnce(&mut TenantTx<'_>) -> TenancyResult<T>,
    {
        if tenant_id <= UNBOUND_TENANT {
            return Err(TenancyError::Configuration(format!(
                "invalid tenant id: {tenant_id}"
            )));
        }

        let mut conn = self.lock()?;
        let binding = BindingGuard::new(&self.binding);
        binding.bind(tenant_id);

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut scoped = TenantTx {
            tx,
            tenant_id,
            binding: &self.binding,
        };

        let value = f(&mut scoped)?;
        scoped.tx.commit()?;
        Ok(value)
    }

    /// Run `f` with no tenant bound. Tenant-isolated tables reject writes
    /// here; reads of base tables are unfiltered, so this is for system
    /// bookkeeping only.
    pub fn with_system<T, F>(&self, f: F) -> TenancyResult<T>
    where
        F: FnOnce(&mut Connection) -> TenancyResult<T>,
    {
        let mut conn = self.lock()?;
        self.binding.store(UNBOUND_TENANT, Ordering::SeqCst);
        f(&mut conn)
    }

    /// As [`with_system`](Self::with_system), but `None` when this thread is
    /// already inside a unit of work on this database.
    pub fn try_with_system<T, F>(&self, f: F) -> Option<TenancyResult<T>>
    where
        F: FnOnce(&mut Connection) -> TenancyResult<T>,
    {
        if self.held_by_current_thread() {
            return None;
        }
        Some(self.with_system(f))
    }

    /// This thread holds the connection lock
    pub fn held_by_current_thread(&self) -> bool {
        HELD.with(|held| held.borrow().contains(&self.id))
    }

    fn lock(&self) -> TenancyResult<HeldConnection<'_>> {
        if self.held_by_current_thread() {
            return Err(TenancyError::Configuration(
                "database re-entered from inside a unit of work on the same thread".into(),
            ));
        }
        let guard = self.conn.lock();
        HELD.with(|held| held.borrow_mut().push(self.id));
        Ok(HeldConnection { guard, id: self.id })
    }

    /// Install the row policy on a table with a `tenant_id` column
    pub fn enable_isolation(&self, table: &str) -> TenancyResult<()> {
        self.with_system(|conn| schema::install_isolation(conn, table, false))
    }

    /// Remove the row policy (triggers, scoped view, registry flag)
    pub fn disable_isolation(&self, table: &str) -> TenancyResult<()> {
        self.with_system(|conn| schema::remove_isolation(conn, table))
    }

    /// Current isolation state of `table`
    pub fn isolation_status(&self, table: &str) -> TenancyResult<IsolationStatus> {
        self.with_system(|conn| schema::isolation_status(conn, table))
    }

    /// Tenant data tables covered by the row policy
    pub fn tenant_tables(&self) -> TenancyResult<Vec<String>> {
        self.with_system(|conn| schema::tenant_tables(conn))
    }
}

/// Connection guard that tracks ownership for re-entry detection
struct HeldConnection<'a> {
    guard: MutexGuard<'a, Connection>,
    id: u64,
}

impl Deref for HeldConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl std::ops::DerefMut for HeldConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.guard
    }
}

impl Drop for HeldConnection<'_> {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|id| *id == self.id) {
                held.remove(pos);
            }
        });
    }
}

/// Clears the tenant marker when dropped, on every exit path.
struct BindingGuard<'a> {
    cell: &'a AtomicI64,
}

impl<'a> BindingGuard<'a> {
    fn new(cell: &'a AtomicI64) -> Self {
        cell.store(UNBOUND_TENANT, Ordering::SeqCst);
        Self { cell }
    }

    fn bind(&self, tenant_id: TenantId) {
        self.cell.store(tenant_id, Ordering::SeqCst);
    }
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        self.cell.store(UNBOUND_TENANT, Ordering::SeqCst);
    }
}

/// A transaction bound to one tenant
pub struct TenantTx<'conn> {
    tx: Transaction<'conn>,
    tenant_id: TenantId,
    binding: &'conn AtomicI64,
}

impl<'conn> TenantTx<'conn> {
    /// Tenant this unit of work was opened for
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Re-bind the unit of work to `tenant_id`
    pub fn rebind(&mut self, tenant_id: TenantId) -> TenancyResult<()> {
        if tenant_id <= UNBOUND_TENANT {
            return Err(TenancyError::Configuration(format!(
                "invalid tenant id: {tenant_id}"
            )));
        }
        self.binding.store(tenant_id, Ordering::SeqCst);
        self.tenant_id = tenant_id;
        Ok(())
    }

    /// Marker as seen by SQL
    pub fn bound_tenant_id(&self) -> TenancyResult<TenantId> {
        Ok(self
            .tx
            .query_row("SELECT current_tenant_id()", [], |row| row.get(0))?)
    }

    /// Isolation state of `table` as seen from this transaction
    pub fn isolation_status(&self, table: &str) -> TenancyResult<IsolationStatus> {
        schema::isolation_status(&self.tx, table)
    }

    /// Tenant data tables covered by the row policy
    pub fn tenant_tables(&self) -> TenancyResult<Vec<String>> {
        schema::tenant_tables(&self.tx)
    }
}

impl Deref for TenantTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn orders_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_system(|conn| {
            conn.execute_batch(
                "CREATE TABLE orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id INTEGER NOT NULL,
                    item TEXT NOT NULL
                );",
            )?;
            Ok(())
        })
        .unwrap();
        db.enable_isolation("orders").unwrap();
        db
    }

    fn insert_order(db: &Database, tenant: TenantId, item: &str) {
        db.with_tenant(tenant, |tx| {
            tx.execute(
                "INSERT INTO orders (tenant_id, item) VALUES (?1, ?2)",
                params![tx.tenant_id(), item],
            )?;
            Ok(())
        })
        .unwrap();
    }

    fn visible_items(db: &Database, tenant: TenantId) -> Vec<String> {
        db.with_tenant(tenant, |tx| {
            let mut stmt = tx.prepare("SELECT item FROM orders_scoped ORDER BY id")?;
            let items = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(items)
        })
        .unwrap()
    }

    #[test]
    fn test_rows_invisible_across_tenants() {
        let db = orders_db();
        insert_order(&db, 1, "pizza");
        insert_order(&db, 2, "sushi");
        insert_order(&db, 1, "salad");

        assert_eq!(visible_items(&db, 1), vec!["pizza", "salad"]);
        assert_eq!(visible_items(&db, 2), vec!["sushi"]);
        assert!(visible_items(&db, 3).is_empty());
    }

    #[test]
    fn test_policy_rejects_foreign_tenant_write() {
        let db = orders_db();
        let result = db.with_tenant(1, |tx| {
            tx.execute("INSERT INTO orders (tenant_id, item) VALUES (2, 'smuggled')", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(TenancyError::IsolationViolation(_))));
        assert!(visible_items(&db, 2).is_empty());
    }

    #[test]
    fn test_reentry_fails_instead_of_blocking() {
        let db = orders_db();
        let nested = db.with_tenant(1, |_| {
            assert!(db.held_by_current_thread());
            assert!(db.try_with_system(|_| Ok(())).is_none());
            db.with_system(|_| Ok(()))
        });
        assert!(matches!(nested, Err(TenancyError::Configuration(_))));

        assert!(!db.held_by_current_thread());
        assert!(matches!(db.try_with_system(|_| Ok(1)), Some(Ok(1))));

        let other = Database::open_in_memory().unwrap();
        let independent = db.with_tenant(1, |_| other.with_system(|_| Ok(2)));
        assert_eq!(independent.unwrap(), 2);
    }

    #[test]
    fn test_replace_cannot_evict_foreign_row() {
        let db = orders_db();
        insert_order(&db, 2, "sushi");

        let evicted = db.with_tenant(1, |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO orders (id, tenant_id, item) VALUES (1, 1, 'evict')",
                [],
            )?;
            Ok(())
        });
        assert!(matches!(evicted, Err(TenancyError::IsolationViolation(_))));
        assert_eq!(visible_items(&db, 2), vec!["sushi"]);

        db.with_tenant(2, |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO orders (id, tenant_id, item) VALUES (1, 2, 'ramen')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        assert_eq!(visible_items(&db, 2), vec!["ramen"]);
    }

    #[test]
    fn test_policy_rejects_cross_tenant_update_and_delete() {
        let db = orders_db();
        insert_order(&db, 2, "sushi");

        let updated = db.with_tenant(1, |tx| {
            tx.execute("UPDATE orders SET item = 'stolen' WHERE tenant_id = 2", [])?;
            Ok(())
        });
        assert!(matches!(updated, Err(TenancyError::IsolationViolation(_))));

        let deleted = db.with_tenant(1, |tx| {
            tx.execute("DELETE FROM orders WHERE tenant_id = 2", [])?;
            Ok(())
        });
        assert!(matches!(deleted, Err(TenancyError::IsolationViolation(_))));
        assert_eq!(visible_items(&db, 2), vec!["sushi"]);
    }

    #[test]
    fn test_unbound_connection_cannot_write_tenant_rows() {
        let db = orders_db();
        let result = db.with_system(|conn| {
            conn.execute("INSERT INTO orders (tenant_id, item) VALUES (1, 'x')", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(TenancyError::IsolationViolation(_))));
    }

    #[test]
    fn test_binding_cleared_after_unit_of_work() {
        let db = orders_db();
        db.with_tenant(5, |tx| {
            assert_eq!(tx.bound_tenant_id()?, 5);
            Ok(())
        })
        .unwrap();

        let bound: TenantId = db
            .with_system(|conn| Ok(conn.query_row("SELECT current_tenant_id()", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(bound, UNBOUND_TENANT);
    }

    #[test]
    fn test_binding_cleared_after_failed_unit_of_work() {
        let db = orders_db();
        let result: TenancyResult<()> = db.with_tenant(5, |_| {
            Err(TenancyError::Persistence("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.binding.load(Ordering::SeqCst), UNBOUND_TENANT);
    }

    #[test]
    fn test_failed_unit_of_work_rolls_back() {
        let db = orders_db();
        let _ = db.with_tenant(1, |tx| {
            tx.execute("INSERT INTO orders (tenant_id, item) VALUES (1, 'ghost')", [])?;
            Err::<(), _>(TenancyError::Persistence("abort".into()))
        });
        assert!(visible_items(&db, 1).is_empty());
    }

    #[test]
    fn test_non_positive_tenant_rejected() {
        let db = orders_db();
        assert!(matches!(
            db.with_tenant(0, |_| Ok(())),
            Err(TenancyError::Configuration(_))
        ));
        assert!(matches!(
            db.with_tenant(-4, |_| Ok(())),
            Err(TenancyError::Configuration(_))
        ));
    }

    #[test]
    fn test_isolation_status_tracks_policy() {
        let db = orders_db();
        assert!(db.isolation_status("orders").unwrap().is_enforced());

        db.disable_isolation("orders").unwrap();
        let status = db.isolation_status("orders").unwrap();
        assert!(status.table_exists);
        assert!(!status.registered);
        assert!(!status.triggers_installed);

        let missing = db.isolation_status("nope").unwrap();
        assert!(!missing.table_exists);
    }

    #[test]
    fn test_tenant_tables_excludes_system_tables() {
        let db = orders_db();
        assert_eq!(db.tenant_tables().unwrap(), vec!["orders".to_string()]);
        assert!(db.isolation_status("backup_records").unwrap().is_enforced());
    }

    #[test]
    fn test_enable_isolation_requires_tenant_column() {
        let db = Database::open_in_memory().unwrap();
        db.with_system(|conn| {
            conn.execute_batch("CREATE TABLE themes (id INTEGER PRIMARY KEY, name TEXT);")?;
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            db.enable_isolation("themes"),
            Err(TenancyError::Configuration(_))
        ));
        assert!(matches!(
            db.enable_isolation("missing"),
            Err(TenancyError::NotFound(_))
        ));
    }

    #[test]
    fn test_file_database_reopens_with_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tenancy.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_system(|conn| {
                conn.execute_batch(
                    "CREATE TABLE orders (id INTEGER PRIMARY KEY, tenant_id INTEGER NOT NULL);",
                )?;
                Ok(())
            })
            .unwrap();
            db.enable_isolation("orders").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.isolation_status("orders").unwrap().is_enforced());
    }
}
