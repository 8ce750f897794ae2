//! Isolation commands

use super::{require_tenant, short_time};
use crate::output::{status_cell, OutputFormat};
use crate::IsolationCommands;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;
use tenancy_security::context::{SecurityEvent, ViolationRecord};
use tenancy_security::TenancyServices;

#[derive(Serialize)]
struct PolicyState<'a> {
    table: &'a str,
    table_exists: bool,
    registered: bool,
    triggers_installed: bool,
    enforced: bool,
}

#[derive(Tabled)]
struct ViolationRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "User")]
    user: i64,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Table")]
    table: String,
}

impl From<&ViolationRecord> for ViolationRow {
    fn from(v: &ViolationRecord) -> Self {
        Self {
            id: v.id,
            time: short_time(v.violation_time),
            user: v.user_id,
            operation: v.operation.clone(),
            table: v.table_name.clone(),
        }
    }
}

#[derive(Tabled)]
struct DenialRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "User")]
    user: i64,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Attempted tenant")]
    attempted: i64,
}

impl From<&SecurityEvent> for DenialRow {
    fn from(e: &SecurityEvent) -> Self {
        Self {
            id: e.id,
            time: short_time(e.created_at),
            user: e.user_id,
            action: e.action.clone(),
            attempted: e.attempted_tenant_id,
        }
    }
}

pub fn handle(action: IsolationCommands, services: &TenancyServices, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        IsolationCommands::Enable { table } => {
            services.db.enable_isolation(&table)?;
            println!("{} {table}", "Row isolation enabled on".green());
        }
        IsolationCommands::Disable { table } => {
            services.db.disable_isolation(&table)?;
            println!("{} {table}", "Row isolation removed from".yellow());
        }
        IsolationCommands::Status { table } => {
            let status = services.db.isolation_status(&table)?;
            let state = PolicyState {
                table: &table,
                table_exists: status.table_exists,
                registered: status.registered,
                triggers_installed: status.triggers_installed,
                enforced: status.is_enforced(),
            };
            if format == OutputFormat::Table {
                let label = if state.enforced { "valid" } else { "invalid" };
                println!("{table}: {}", status_cell(label));
            }
            format.print(&state)?;
        }
        IsolationCommands::Check { tenant, table } => {
            let visible = services
                .contexts
                .verify_data_integrity(require_tenant(tenant)?, &table)?;
            format.print(&serde_json::json!({
                "tenant_id": tenant,
                "table": table,
                "visible_rows": visible,
                "foreign_rows": 0,
            }))?;
        }
        IsolationCommands::Violations { tenant, limit } => {
            let records = services.contexts.violations(require_tenant(tenant)?, limit)?;
            format.print_rows(&records, ViolationRow::from)?;
        }
        IsolationCommands::Denials { tenant, limit } => {
            let events = services.contexts.security_events(require_tenant(tenant)?, limit)?;
            format.print_rows(&events, DenialRow::from)?;
        }
    }
    Ok(())
}
