//! Error types for tenant isolation

use thiserror::Error;

/// Message raised by the storage-layer row policy when a write targets
/// another tenant's rows.
pub const ISOLATION_ABORT: &str = "tenant isolation violation";

/// Tenancy error type
#[derive(Error, Debug)]
pub enum TenancyError {
    /// Missing or malformed configuration (key file, tenant id, paths)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tenant mismatch or table without enforced isolation
    #[error("isolation violation: {0}")]
    IsolationViolation(String),

    /// Database or file I/O failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Authentication tag failure or artifact mismatch
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Entity not found (or not visible to the bound tenant)
    #[error("not found: {0}")]
    NotFound(String),

    /// Input rejected before any side effect
    #[error("invalid input: {0}")]
    Validation(String),

    /// Audit log no longer accepts entries
    #[error("audit log is shut down")]
    AuditClosed,
}

impl TenancyError {
    /// Security failures that must halt the business operation
    pub fn is_security_failure(&self) -> bool {
        matches!(self, Self::IsolationViolation(_) | Self::Integrity(_))
    }
}

impl From<rusqlite::Error> for TenancyError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains(ISOLATION_ABORT) => {
                Self::IsolationViolation(msg.clone())
            }
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("no matching row".into()),
            _ => Self::Persistence(e.to_string()),
        }
    }
}

impl From<std::io::Error> for TenancyError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

/// Result type for tenancy operations
pub type TenancyResult<T> = Result<T, TenancyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_abort_maps_to_isolation_violation() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some(format!("{ISOLATION_ABORT}: orders")),
        );
        let mapped = TenancyError::from(err);
        assert!(matches!(mapped, TenancyError::IsolationViolation(_)));
        assert!(mapped.is_security_failure());
    }

    #[test]
    fn test_io_error_is_persistence() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(TenancyError::from(err), TenancyError::Persistence(_)));
    }
}
