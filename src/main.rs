use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deposit_guard::{config::Config, router, AppState};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.app.rust_log)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if config.is_json_logging() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config);

    info!("Starting deposit guard ({})", config.app.environment);
    info!(
        "Attendance default policy: {}, grace period {} min, venue timezone {}",
        config.attendance.default_policy.as_str(),
        config.attendance.grace_period_mins,
        config.deposit.venue_timezone
    );

    let app_state = AppState::connect(config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize application state: {e}"))?;

    // --- Start background tasks ---

    // Проверка посещаемости по ручным холдам
    let attendance = app_state.attendance();
    let attendance_interval = Duration::from_secs(config.attendance.sweep_interval_secs.max(1));
    task::spawn(async move {
        loop {
            if let Err(e) = attendance.sweep().await {
                error!("Attendance sweep failed: {}", e);
            }
            tokio::time::sleep(attendance_interval).await;
        }
    });

    // Списание отложенных депозитов
    let pre_charge = app_state.pre_charge();
    task::spawn(async move {
        loop {
            if let Err(e) = pre_charge.run().await {
                error!("Pre-charge sweep failed: {}", e);
            }
            tokio::time::sleep(attendance_interval).await;
        }
    });

    // Очистка журнала идемпотентности раз в час
    let ledger = app_state.ledger.clone();
    let retention = config.ledger.retention();
    let ledger_interval = Duration::from_secs(config.ledger.sweep_interval_secs.max(1));
    task::spawn(async move {
        loop {
            if let Err(e) = ledger.sweep(retention).await {
                error!("Ledger sweep failed: {}", e);
            }
            tokio::time::sleep(ledger_interval).await;
        }
    });

    // --- Start the web server ---

    let app = router(app_state);
    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("invalid HOST/PORT")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
