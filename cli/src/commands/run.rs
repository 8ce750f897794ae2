//! Long-running mode: retention sweeper until Ctrl-C

use tenancy_security::{SecurityConfig, TenancyServices};

pub async fn handle(services: &TenancyServices, config: &SecurityConfig) -> anyhow::Result<()> {
    tracing::info!("OpenTenancy v{}", env!("CARGO_PKG_VERSION"));
    let sweeper = services.spawn_sweeper(&config.backup);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    sweeper.shutdown().await;
    Ok(())
}
