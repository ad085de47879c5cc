use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tenant_billing::{
    build_state, create_router, init_observability, shutdown_tracing, AppState, Config, Database,
    HttpPaymentGateway, Store,
};

async fn build(config: &Config) -> Result<AppState> {
    let metrics = init_observability(config).await?;

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(database);

    let payment_gateway = HttpPaymentGateway::new(&config.gateway)?;
    if !payment_gateway.is_configured() {
        warn!("Payment gateway server key not set, charges will be rejected");
    }

    Ok(build_state(config, store, Arc::new(payment_gateway), metrics))
}

async fn sweep_once(state: &AppState) -> Result<()> {
    let report = state.scheduler.run(Utc::now()).await;
    info!(
        tenants = report.tenants,
        failures = report.failures.len(),
        purged_events = report.purged_events,
        purged_notifications = report.purged_notifications,
        "Billing sweep finished"
    );
    if !report.is_clean() {
        bail!("{} billing sweep task(s) failed", report.failures.len());
    }
    Ok(())
}

async fn serve(config: Config, state: AppState) -> Result<()> {
    if config.billing.sweep_interval_hours > 0 {
        let scheduler_state = state.clone();
        let period = Duration::from_secs(config.billing.sweep_interval_hours * 3600);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = sweep_once(&scheduler_state).await {
                    error!(error = %e, "Scheduled billing sweep incomplete");
                }
            }
        });
        info!(hours = config.billing.sweep_interval_hours, "Billing sweep scheduled");
    }

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address).await?;
    info!("Tenant billing API listening on {}", address);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down gracefully");
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    let command = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());

    let state = build(&config).await?;
    info!(command = %command, "Starting tenant billing");

    let result = match command.as_str() {
        "serve" => serve(config, state).await,
        "billing-sweep" => sweep_once(&state).await,
        other => Err(anyhow::anyhow!("unknown command '{other}', expected serve or billing-sweep")),
    };

    shutdown_tracing();
    result
}
