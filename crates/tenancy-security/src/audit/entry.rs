//! Audit entry model and hash chain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tenancy_common::{to_millis, TenantId, UserId};

/// `prev_hash` of the first entry in each tenant's chain
pub const GENESIS_HASH: &str = "genesis";

/// Outcome of an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Action completed
    Success,
    /// Action was refused or errored
    Failure,
}

impl AuditStatus {
    /// Stored form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Inverse of [`AuditStatus::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Storage id, assigned when persisted
    pub id: Option<i64>,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Acting user
    pub user_id: UserId,
    /// What was done, e.g. `backup_created`
    pub action: String,
    /// Kind of resource acted on
    pub resource_type: String,
    /// Id of the resource acted on
    pub resource_id: String,
    /// Free-form context, usually JSON
    pub details: String,
    /// Client address
    pub ip_address: String,
    /// Client agent string
    pub user_agent: String,
    /// Outcome
    pub status: AuditStatus,
    /// Set when `status` is failure
    pub error_message: String,
    /// How long the action took
    pub duration: Duration,
    /// When the action happened
    pub created_at: DateTime<Utc>,
    /// Hash of the tenant's previous entry, set when persisted
    pub prev_hash: Option<String>,
    /// Hash of this entry, set when persisted
    pub entry_hash: Option<String>,
}

impl AuditLogEntry {
    /// Successful `action` by `user_id` in `tenant_id`, timestamped now
    pub fn new(tenant_id: TenantId, user_id: UserId, action: impl Into<String>) -> Self {
        Self {
            id: None,
            tenant_id,
            user_id,
            action: action.into(),
            resource_type: String::new(),
            resource_id: String::new(),
            details: String::new(),
            ip_address: String::new(),
            user_agent: String::new(),
            status: AuditStatus::Success,
            error_message: String::new(),
            duration: Duration::ZERO,
            created_at: Utc::now(),
            prev_hash: None,
            entry_hash: None,
        }
    }

    /// Attach the resource acted on
    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = resource_id.into();
        self
    }

    /// Attach free-form context
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Attach the client address and agent
    pub fn client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self.user_agent = user_agent.into();
        self
    }

    /// Mark as failed with `error`
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = AuditStatus::Failure;
        self.error_message = error.into();
        self
    }

    /// Set how long the action took
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Has a storage id
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub(crate) fn duration_ms(&self) -> i64 {
        self.duration.as_millis().min(i64::MAX as u128) as i64
    }

    /// Chain hash over the stored representation of every field, so the
    /// hash recomputes identically after a reload.
    pub(crate) fn compute_hash(&self, prev_hash: &str) -> String {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };
        field(prev_hash.as_bytes());
        field(&self.tenant_id.to_be_bytes());
        field(&self.user_id.to_be_bytes());
        field(self.action.as_bytes());
        field(self.resource_type.as_bytes());
        field(self.resource_id.as_bytes());
        field(self.details.as_bytes());
        field(self.ip_address.as_bytes());
        field(self.user_agent.as_bytes());
        field(self.status.as_str().as_bytes());
        field(self.error_message.as_bytes());
        field(&self.duration_ms().to_be_bytes());
        field(&to_millis(self.created_at).to_be_bytes());
        hex::encode(hasher.finalize())
    }
}
