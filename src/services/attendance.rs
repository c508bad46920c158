use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{AttendanceConfig, AttendancePolicy};
use crate::error::PaymentError;
use crate::models::booking::Booking;
use crate::services::resolution::{stale_claim_cutoff, Operation, ResolutionService};
use crate::services::store::BookingStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub left_pending: usize,
    /// Бронь успели разрешить другим путём (админ или вебхук).
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub(crate) fn tally(&mut self, id: Uuid, operation: &str, result: Result<Booking, PaymentError>) {
        match result {
            Ok(_) => self.settled += 1,
            Err(PaymentError::InvalidState(reason)) => {
                info!("{} skipped for booking {}: {}", operation, id, reason);
                self.skipped += 1;
            }
            Err(PaymentError::InvalidStateTransition { from, to }) => {
                info!("{} skipped for booking {}: {} -> {} not allowed", operation, id, from, to);
                self.skipped += 1;
            }
            Err(e) => {
                error!("{} failed for booking {}: {}", operation, id, e);
                self.failed += 1;
            }
        }
    }
}

/// Момент окончания брони в UTC с учётом часового пояса площадки.
pub fn booking_ends_at(booking: &Booking, tz: Tz) -> DateTime<Utc> {
    let local = booking.date.and_time(booking.end_time);
    match tz.from_local_datetime(&local).earliest() {
        Some(end) => end.with_timezone(&Utc),
        // Время попало в переход на летнее время
        None => local.and_utc(),
    }
}

/// Фоновая проверка посещаемости для ручных холдов, которые никто не разрешил.
pub struct AttendanceResolver {
    store: Arc<dyn BookingStore>,
    resolutions: Arc<ResolutionService>,
    config: AttendanceConfig,
    tz: Tz,
}

impl AttendanceResolver {
    pub fn new(
        store: Arc<dyn BookingStore>,
        resolutions: Arc<ResolutionService>,
        config: AttendanceConfig,
        tz: Tz,
    ) -> Self {
        Self { store, resolutions, config, tz }
    }

    pub async fn sweep(&self) -> Result<SweepReport, PaymentError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, PaymentError> {
        let today = now.with_timezone(&self.tz).date_naive();
        let cutoff = now - Duration::minutes(self.config.grace_period_mins);

        let due: Vec<Booking> = self
            .store
            .list_unresolved_holds(today, stale_claim_cutoff(now))
            .await?
            .into_iter()
            .filter(|booking| booking_ends_at(booking, self.tz) <= cutoff)
            .collect();

        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        info!(
            "Attendance sweep: {} unresolved holds past grace period, policy={}",
            due.len(),
            self.config.default_policy.as_str()
        );

        match self.config.default_policy {
            AttendancePolicy::LeavePending => {
                for booking in &due {
                    info!("Booking {} left pending for manual review", booking.id);
                }
                report.left_pending = due.len();
            }
            AttendancePolicy::NoShow => {
                let resolutions = Arc::clone(&self.resolutions);
                let results: Vec<(Uuid, Result<Booking, PaymentError>)> = stream::iter(due)
                    .map(move |booking| {
                        let resolutions = Arc::clone(&resolutions);
                        async move {
                            let result = resolutions.run_at(Operation::MarkNoShow, booking.id, now).await;
                            (booking.id, result)
                        }
                    })
                    .buffer_unordered(self.config.concurrency.max(1))
                    .collect()
                    .await;
                for (id, result) in results {
                    report.tally(id, "automatic no-show", result);
                }
            }
        }

        info!("Attendance sweep finished: {:?}", report);
        Ok(report)
    }
}
