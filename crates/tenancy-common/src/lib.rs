//! OpenTenancy Common - storage foundation for tenant isolation
//!
//! This crate provides:
//! - The error taxonomy shared by every security component
//! - A SQLite database handle with a per-connection tenant marker
//! - The tenant-bound unit of work ([`TenantTx`])
//! - The storage-layer row policy (triggers + scoped views)
//! - A filter query builder for list/count operations
//!
//! # Row isolation
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Database::with_tenant(7, |tx| ...)                          │
//! │     │ reset marker → bind 7 → BEGIN IMMEDIATE               │
//! │     ▼                                                        │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ current_tenant_id() = 7                                │  │
//! │  │   INSERT/UPDATE/DELETE triggers: tenant_id must be 7   │  │
//! │  │   <table>_scoped views: WHERE tenant_id = 7            │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │     │ COMMIT / ROLLBACK → marker cleared                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod db;
pub mod error;
pub mod filter;
pub mod schema;

pub use db::{Database, TenantTx, UNBOUND_TENANT};
pub use error::{TenancyError, TenancyResult, ISOLATION_ABORT};
pub use filter::{Cmp, FilterQuery};
pub use schema::{table_columns, validate_identifier, IsolationStatus};

use chrono::{DateTime, TimeZone, Utc};

/// Tenant ID
pub type TenantId = i64;

/// User ID
pub type UserId = i64;

/// Current time as Unix milliseconds, the storage representation
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Unix milliseconds back to a UTC timestamp
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// UTC timestamp to Unix milliseconds
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip_keeps_precision() {
        let ts = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(ts), 1_700_000_000_123);
    }

    #[test]
    fn test_now_is_recent() {
        let now = now_millis();
        assert!(now > 1_600_000_000_000);
    }
}
