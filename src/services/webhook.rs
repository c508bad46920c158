use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::booking::Booking;
use crate::models::webhook::{DeadLetter, GatewayEvent, GatewayEventKind};
use crate::services::gateway::PaymentGateway;
use crate::services::ledger::IdempotencyLedger;
use crate::services::notifications::{dispatch, NotificationKind, Notifier};
use crate::services::state_machine::{decide, Decision};
use crate::services::store::BookingStore;

// Одна повторная попытка read-modify-write при конфликте версий
const APPLY_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    BookingNotFound,
    AlreadyApplied,
    Anomaly,
    ManualReview,
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::BookingNotFound => "booking_not_found",
            Self::AlreadyApplied => "already_applied",
            Self::Anomaly => "anomaly",
            Self::ManualReview => "manual_review",
            Self::Ignored => "ignored",
        }
    }
}

type Applied = (WebhookOutcome, Option<(NotificationKind, Booking)>);

pub struct WebhookProcessor {
    store: Arc<dyn BookingStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn BookingStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { store, ledger, gateway, notifier }
    }

    /// Обрабатывает сырое тело вебхука. `Ok` - подтверждаем шлюзу (200),
    /// `Err` до уведомления - просим повторную доставку.
    pub async fn handle(&self, raw_body: &[u8], signature: &str) -> Result<WebhookOutcome, PaymentError> {
        // Подпись проверяется до любого обращения к журналу
        let event = self.gateway.verify_signature(raw_body, signature)?;
        let span = tracing::info_span!("webhook", event_id = %event.id, event_type = %event.event_type);
        self.process(event, raw_body).instrument(span).await
    }

    async fn process(&self, event: GatewayEvent, raw_body: &[u8]) -> Result<WebhookOutcome, PaymentError> {
        if !self.ledger.claim(&event.id).await? {
            info!("Duplicate delivery acknowledged");
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.apply(&event).await {
            Ok((outcome, notification)) => {
                if let Some((kind, booking)) = notification {
                    dispatch(self.notifier.clone(), kind, booking);
                }
                info!("Webhook processed: {}", outcome.as_str());
                Ok(outcome)
            }
            Err(e) => {
                error!("Webhook processing failed after claim: {}", e);
                self.unclaim(&event, raw_body, &e).await;
                Err(e)
            }
        }
    }

    // Событие не должно потеряться: либо снимаем захват ради повторной
    // доставки, либо кладём его в dead letter для ручного разбора
    async fn unclaim(&self, event: &GatewayEvent, raw_body: &[u8], cause: &PaymentError) {
        let Err(release_err) = self.ledger.release(&event.id).await else {
            return;
        };
        error!("Failed to release ledger claim: {}", release_err);

        let entry = DeadLetter {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            payload: String::from_utf8_lossy(raw_body).into_owned(),
            reason: cause.to_string(),
            failed_at: Utc::now(),
        };
        if let Err(dl_err) = self.ledger.dead_letter(&entry).await {
            error!(
                "Webhook event {} could not be dead-lettered either: {}. Payload: {}",
                event.id, dl_err, entry.payload
            );
        }
    }

    async fn apply(&self, event: &GatewayEvent) -> Result<Applied, PaymentError> {
        let kind = event.kind();
        if let GatewayEventKind::Unknown(event_type) = &kind {
            info!("Ignoring unsupported event type {}", event_type);
            return Ok((WebhookOutcome::Ignored, None));
        }

        let mut booking_id: Option<Uuid> = None;
        for attempt in 1..=APPLY_ATTEMPTS {
            let Some(mut booking) = self.store.find_by_authorization(&event.data.authorization_id).await? else {
                warn!(
                    "No booking linked to authorization {}, acknowledging",
                    event.data.authorization_id
                );
                return Ok((WebhookOutcome::BookingNotFound, None));
            };
            booking_id = Some(booking.id);

            match decide(&booking, &kind, event.data.amount) {
                Decision::Advance(transition) => {
                    let now = Utc::now();
                    let patch = transition.patch(now);
                    let from = booking.payment_status;
                    if self
                        .store
                        .update_booking_conditional(booking.id, booking.version, &patch)
                        .await?
                    {
                        booking.apply(&patch, now);
                        booking.version += 1;
                        info!(
                            "Booking {} payment {} -> {}, status {}",
                            booking.id, from, booking.payment_status, booking.status
                        );
                        return Ok((WebhookOutcome::Applied, transition.notify.map(|k| (k, booking))));
                    }
                    warn!(
                        "Booking {} changed concurrently (attempt {}/{}), re-reading",
                        booking.id, attempt, APPLY_ATTEMPTS
                    );
                }
                Decision::AlreadyApplied => {
                    info!("Booking {} already reflects this event", booking.id);
                    return Ok((WebhookOutcome::AlreadyApplied, None));
                }
                Decision::ManualReview(reason) => {
                    warn!("Manual review required for booking {}: {}", booking.id, reason);
                    return Ok((WebhookOutcome::ManualReview, None));
                }
                Decision::Anomaly(reason) => {
                    warn!("Webhook anomaly on booking {}: {}", booking.id, reason);
                    return Ok((WebhookOutcome::Anomaly, None));
                }
                Decision::Ignored => return Ok((WebhookOutcome::Ignored, None)),
            }
        }

        Err(PaymentError::ConcurrentUpdateConflict(booking_id.unwrap_or_default()))
    }
}
