//! Backup commands

use super::{require_tenant, short_time};
use crate::output::{human_size, status_cell, OutputFormat};
use crate::{BackupCommands, BackupKind};
use tabled::Tabled;
use tenancy_security::{
    BackupRecord, BackupType, RetentionSweeper, SecurityConfig, TenancyServices,
};

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Type")]
    backup_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Retention")]
    retention: String,
    #[tabled(rename = "Encrypted")]
    encrypted: bool,
    #[tabled(rename = "Verified")]
    verified: bool,
}

impl From<&BackupRecord> for BackupRow {
    fn from(r: &BackupRecord) -> Self {
        Self {
            id: r.id,
            backup_type: r.backup_type.to_string(),
            status: status_cell(r.status.as_str()),
            started: short_time(r.start_time),
            size: human_size(r.size),
            retention: format!("{}d", r.retention_days),
            encrypted: r.encrypted,
            verified: r.verified,
        }
    }
}

impl From<BackupKind> for BackupType {
    fn from(kind: BackupKind) -> Self {
        match kind {
            BackupKind::Full => BackupType::Full,
            BackupKind::Incremental => BackupType::Incremental,
            BackupKind::Differential => BackupType::Differential,
        }
    }
}

pub async fn handle(
    action: BackupCommands,
    services: &TenancyServices,
    config: &SecurityConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let backups = &services.backups;
    match action {
        BackupCommands::Create { tenant, kind } => {
            let record = backups
                .create_tenant_backup(require_tenant(tenant)?, kind.into())
                .await?;
            format.print_rows(std::slice::from_ref(&record), BackupRow::from)?;
        }
        BackupCommands::List { tenant } => {
            let records = backups.list_tenant_backups(require_tenant(tenant)?)?;
            format.print_rows(&records, BackupRow::from)?;
        }
        BackupCommands::Status { tenant } => {
            let summary = backups.get_backup_status(require_tenant(tenant)?)?;
            format.print(&summary)?;
        }
        BackupCommands::Verify { tenant, id } => {
            let check = backups
                .verify_backup_integrity(require_tenant(tenant)?, id)
                .await?;
            format.print(&check)?;
        }
        BackupCommands::Restore { tenant, id, yes } => {
            anyhow::ensure!(
                yes,
                "restore overwrites tenant {tenant}'s current rows; pass --yes to confirm"
            );
            let summary = backups
                .restore_tenant_backup(require_tenant(tenant)?, id)
                .await?;
            format.print(&summary)?;
        }
        BackupCommands::Sweep { tenant: Some(tenant) } => {
            let deleted = backups.delete_expired_backups(require_tenant(tenant)?).await?;
            format.print(&serde_json::json!({ "tenant_id": tenant, "expired": deleted }))?;
        }
        BackupCommands::Sweep { tenant: None } => {
            let report =
                RetentionSweeper::run_once(backups, config.backup.stale_after()).await;
            format.print(&report)?;
        }
    }
    Ok(())
}
