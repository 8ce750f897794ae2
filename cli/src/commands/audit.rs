//! Audit commands

use super::{require_tenant, short_time};
use crate::output::{status_cell, OutputFormat};
use crate::{AuditCommands, ExportKind};
use anyhow::Context;
use chrono::{Duration, Utc};
use tabled::Tabled;
use tenancy_security::{AuditFilter, AuditLogEntry, AuditStatus, ExportFormat, TenancyServices};

#[derive(Tabled)]
struct AuditRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "User")]
    user: i64,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&AuditLogEntry> for AuditRow {
    fn from(e: &AuditLogEntry) -> Self {
        let resource = match (e.resource_type.as_str(), e.resource_id.as_str()) {
            ("", "") => String::new(),
            (ty, "") => ty.to_string(),
            (ty, id) => format!("{ty}/{id}"),
        };
        Self {
            id: e.id.unwrap_or_default(),
            time: short_time(e.created_at),
            user: e.user_id,
            action: e.action.clone(),
            resource,
            status: status_cell(e.status.as_str()),
            error: e.error_message.clone(),
        }
    }
}

impl From<ExportKind> for ExportFormat {
    fn from(kind: ExportKind) -> Self {
        match kind {
            ExportKind::Json => ExportFormat::Json,
            ExportKind::Csv => ExportFormat::Csv,
            ExportKind::Cef => ExportFormat::Cef,
        }
    }
}

pub fn handle(action: AuditCommands, services: &TenancyServices, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        AuditCommands::Show {
            tenant,
            user,
            action,
            failed_since,
            limit,
            offset,
        } => {
            let mut filter = AuditFilter::tenant(require_tenant(tenant)?).page(limit, offset);
            filter.user_id = user;
            filter.action = action;
            if let Some(minutes) = failed_since {
                filter = filter
                    .status(AuditStatus::Failure)
                    .since(Utc::now() - Duration::minutes(minutes));
            }
            let entries = services.audit.query(&filter)?;
            format.print_rows(&entries, AuditRow::from)?;
        }
        AuditCommands::Verify { tenant } => {
            let result = services.audit.verify_chain(require_tenant(tenant)?)?;
            format.print(&result)?;
            anyhow::ensure!(
                result.valid,
                "audit chain for tenant {tenant} is broken: {}",
                result.error.unwrap_or_default()
            );
        }
        AuditCommands::Export { tenant, kind, output } => {
            let rendered = services.audit.export(require_tenant(tenant)?, kind.into())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported tenant {tenant} audit trail to {}", path.display());
                }
                None => println!("{rendered}"),
            }
        }
    }
    Ok(())
}
