pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod services;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::{PgStaffDirectory, StaffDirectory};
use crate::services::{
    attendance::AttendanceResolver,
    gateway::{HttpGatewayClient, PaymentGateway},
    ledger::{IdempotencyLedger, RedisLedger},
    notifications::{HttpNotifier, LogNotifier, Notifier},
    orchestrator::PaymentOrchestrator,
    precharge::PreChargeScheduler,
    resolution::ResolutionService,
    retry::RetryPolicy,
    store::{BookingStore, PgBookingStore},
    webhook::WebhookProcessor,
};

// Shared state для всего приложения
pub struct AppState {
    pub config: config::Config,
    pub store: Arc<dyn BookingStore>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub staff: Arc<dyn StaffDirectory>,
    pub orchestrator: PaymentOrchestrator,
    pub webhooks: WebhookProcessor,
    pub resolutions: Arc<ResolutionService>,
}

impl AppState {
    /// Собирает сервисы поверх готовых реализаций хранилищ и шлюза.
    pub fn from_parts(
        config: config::Config,
        store: Arc<dyn BookingStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        staff: Arc<dyn StaffDirectory>,
    ) -> Arc<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        let orchestrator = PaymentOrchestrator::new(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
            config.deposit.clone(),
            config.payment.currency.clone(),
            retry,
        );
        let webhooks = WebhookProcessor::new(store.clone(), ledger.clone(), gateway.clone(), notifier.clone());
        let resolutions = Arc::new(ResolutionService::new(store.clone(), gateway, notifier, retry));

        Arc::new(Self {
            config,
            store,
            ledger,
            staff,
            orchestrator,
            webhooks,
            resolutions,
        })
    }

    /// Подключается к Postgres и Redis, прогоняет миграции.
    pub async fn connect(config: config::Config) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let db = database::Database::new(&config.database.url, config.database.pool_size).await?;
        info!("Database connected");
        db.run_migrations().await?;

        let redis = redis_client::RedisClient::new(&config.redis.url).await?;
        info!("Redis connected");

        let store: Arc<dyn BookingStore> = Arc::new(PgBookingStore::new(db.pool.clone()));
        let ledger: Arc<dyn IdempotencyLedger> = Arc::new(RedisLedger::new(redis, config.ledger.retention()));
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(HttpGatewayClient::from_config(&config.payment, &config.circuit_breaker)?);
        let notifier: Arc<dyn Notifier> = match &config.notifications.dispatcher_url {
            Some(url) if !url.is_empty() => Arc::new(HttpNotifier::new(url.clone())?),
            _ => {
                info!("Notification dispatcher not configured, notifications go to the log");
                Arc::new(LogNotifier)
            }
        };
        let staff: Arc<dyn StaffDirectory> = Arc::new(PgStaffDirectory::new(db.pool.clone()));

        Ok(Self::from_parts(config, store, ledger, gateway, notifier, staff))
    }

    pub fn attendance(&self) -> AttendanceResolver {
        AttendanceResolver::new(
            self.store.clone(),
            self.resolutions.clone(),
            self.config.attendance.clone(),
            self.config.deposit.venue_timezone,
        )
    }

    pub fn pre_charge(&self) -> PreChargeScheduler {
        PreChargeScheduler::new(
            self.store.clone(),
            self.resolutions.clone(),
            self.config.deposit.pre_charge_days,
            self.config.deposit.venue_timezone,
            self.config.attendance.concurrency,
        )
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Deposit Guard v0.1" }))
        .route("/health", get(|| async { "OK" }))
        .merge(controllers::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
