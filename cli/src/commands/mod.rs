//! CLI Commands

pub mod audit;
pub mod backup;
pub mod config;
pub mod isolation;
pub mod run;

use chrono::{DateTime, Utc};

/// Timestamp as shown in tables
pub fn short_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Refuse non-positive tenant ids before touching the database
pub fn require_tenant(tenant: i64) -> anyhow::Result<i64> {
    anyhow::ensure!(tenant > 0, "tenant id must be positive, got {tenant}");
    Ok(tenant)
}
