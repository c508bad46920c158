use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::booking::Booking;
use crate::services::attendance::SweepReport;
use crate::services::resolution::{stale_claim_cutoff, Operation, ResolutionService};
use crate::services::store::BookingStore;

/// Списывает отложенные (automatic) депозиты за `pre_charge_days` дней до даты брони.
pub struct PreChargeScheduler {
    store: Arc<dyn BookingStore>,
    resolutions: Arc<ResolutionService>,
    pre_charge_days: i64,
    tz: Tz,
    concurrency: usize,
}

impl PreChargeScheduler {
    pub fn new(
        store: Arc<dyn BookingStore>,
        resolutions: Arc<ResolutionService>,
        pre_charge_days: i64,
        tz: Tz,
        concurrency: usize,
    ) -> Self {
        Self { store, resolutions, pre_charge_days, tz, concurrency }
    }

    pub async fn run(&self) -> Result<SweepReport, PaymentError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport, PaymentError> {
        let horizon = now.with_timezone(&self.tz).date_naive() + Duration::days(self.pre_charge_days);
        let due = self.store.list_deferred_due(horizon, stale_claim_cutoff(now)).await?;

        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        info!("Pre-charge sweep: {} deferred deposits due on or before {}", due.len(), horizon);

        let resolutions = Arc::clone(&self.resolutions);
        let results: Vec<(Uuid, Result<Booking, PaymentError>)> = stream::iter(due)
            .map(move |booking| {
                let resolutions = Arc::clone(&resolutions);
                async move {
                    let result = resolutions.run_at(Operation::PreCharge, booking.id, now).await;
                    (booking.id, result)
                }
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;
        for (id, result) in results {
            report.tally(id, "pre-charge", result);
        }

        info!("Pre-charge sweep finished: {:?}", report);
        Ok(report)
    }
}
