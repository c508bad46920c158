use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DepositConfig;
use crate::error::PaymentError;
use crate::models::booking::{
    Booking, BookingPatch, BookingStatus, CaptureMethod, ClientContact, PaymentAuthorization, PaymentStatus,
};
use crate::services::gateway::{AuthorizationRequest, PaymentGateway};
use crate::services::notifications::{dispatch, NotificationKind, Notifier};
use crate::services::retry::RetryPolicy;
use crate::services::state_machine::ensure_transition;
use crate::services::store::BookingStore;

/// Верхняя граница стоимости брони в минимальных единицах (100 млн в валюте).
pub const MAX_TOTAL_PRICE: i64 = 10_000_000_000;

/// Календарные дни от "сегодня" площадки до даты брони.
/// Считается в часовом поясе площадки, а не сервера.
pub fn lead_days(now: DateTime<Utc>, tz: Tz, date: NaiveDate) -> i64 {
    let today = now.with_timezone(&tz).date_naive();
    (date - today).num_days()
}

/// Данные новой брони после валидации на HTTP-слое. Цены в минимальных единицах.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub space_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub party_size: i32,
    pub base_price: i64,
    pub additional_services_price: i64,
    pub client: Option<ClientContact>,
}

#[derive(Debug, Clone)]
pub enum CreatedBooking {
    /// Депозит авторизован, бронь подтверждена.
    Confirmed(Booking),
    /// Депозит не нужен, бронь ждёт подтверждения площадкой.
    NoDepositRequired(Booking),
    /// Шлюз недоступен: бронь сохранена как pending/failed, авторизацию можно повторить.
    AuthorizationPending(Booking),
}

impl CreatedBooking {
    pub fn booking(&self) -> &Booking {
        match self {
            Self::Confirmed(b) | Self::NoDepositRequired(b) | Self::AuthorizationPending(b) => b,
        }
    }
}

pub struct PaymentOrchestrator {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    deposit: DepositConfig,
    currency: String,
    retry: RetryPolicy,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        deposit: DepositConfig,
        currency: String,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, gateway, notifier, deposit, currency, retry }
    }

    fn capture_method_for(&self, lead: i64) -> CaptureMethod {
        if lead < self.deposit.manual_capture_lead_days {
            CaptureMethod::Manual
        } else {
            CaptureMethod::Automatic
        }
    }

    pub async fn get_booking(&self, id: Uuid) -> Result<Booking, PaymentError> {
        self.store
            .get_booking(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("booking {id}")))
    }

    pub async fn create_booking(&self, new: NewBooking) -> Result<CreatedBooking, PaymentError> {
        self.create_booking_at(new, Utc::now()).await
    }

    pub async fn create_booking_at(&self, new: NewBooking, now: DateTime<Utc>) -> Result<CreatedBooking, PaymentError> {
        if new.end_time <= new.start_time {
            return Err(PaymentError::Validation("end_time must be after start_time".into()));
        }
        if new.base_price < 0 || new.additional_services_price < 0 {
            return Err(PaymentError::Validation("prices must not be negative".into()));
        }
        let total = new
            .base_price
            .checked_add(new.additional_services_price)
            .filter(|total| *total <= MAX_TOTAL_PRICE)
            .ok_or_else(|| PaymentError::Validation(format!("total price must not exceed {MAX_TOTAL_PRICE}")))?;

        let space = self
            .store
            .get_space(new.space_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("space {}", new.space_id)))?;

        let lead = lead_days(now, self.deposit.venue_timezone, new.date);
        if lead < 0 {
            return Err(PaymentError::Validation(format!("booking date {} is in the past", new.date)));
        }

        let mut booking = Booking {
            id: Uuid::new_v4(),
            space_id: space.id,
            date: new.date,
            start_time: new.start_time,
            end_time: new.end_time,
            party_size: new.party_size,
            base_price: new.base_price,
            additional_services_price: new.additional_services_price,
            total_price: total,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::NotRequired,
            requires_payment: false,
            authorization: None,
            pending_action: None,
            resolved_at: None,
            client: new.client,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let Some(deposit) = space.deposit_policy.deposit_for(total)? else {
            self.store.insert_booking(&booking).await?;
            info!("Booking {} created without deposit for space {}", booking.id, space.name);
            return Ok(CreatedBooking::NoDepositRequired(booking));
        };

        let capture_method = self.capture_method_for(lead);
        let request = AuthorizationRequest {
            booking_id: booking.id,
            amount: deposit,
            currency: self.currency.clone(),
            capture_method,
            idempotency_key: format!("{}:authorize", booking.id),
        };
        booking.requires_payment = true;
        let mut authorization = PaymentAuthorization {
            handle: None,
            amount: deposit,
            currency: self.currency.clone(),
            capture_method,
            captured_amount: None,
            authorized_at: None,
            captured_at: None,
            released_at: None,
            refunded_at: None,
        };

        info!(
            "Booking {}: lead_days={}, deposit={} {}, capture_method={}",
            booking.id,
            lead,
            deposit,
            self.currency,
            capture_method.as_str()
        );

        match self.retry.run("authorize", || self.gateway.authorize(&request)).await {
            Ok(handle) => {
                authorization.handle = Some(handle.clone());
                authorization.authorized_at = Some(now);
                booking.authorization = Some(authorization);
                booking.status = BookingStatus::Confirmed;
                booking.payment_status = PaymentStatus::Authorized;

                if let Err(e) = self.store.insert_booking(&booking).await {
                    // Без записи брони холд висел бы на карте клиента
                    error!("Failed to persist booking {} after authorization: {}", booking.id, e);
                    let key = format!("{}:release", booking.id);
                    if let Err(release_err) = self.gateway.release(&handle, &key).await {
                        error!("Orphaned authorization {} could not be released: {}", handle, release_err);
                    }
                    return Err(e);
                }

                dispatch(self.notifier.clone(), NotificationKind::Confirmed, booking.clone());
                Ok(CreatedBooking::Confirmed(booking))
            }
            Err(e) if e.is_transient() => {
                warn!("Authorization for booking {} deferred: {}", booking.id, e);
                booking.authorization = Some(authorization);
                booking.payment_status = PaymentStatus::Failed;
                self.store.insert_booking(&booking).await?;
                Ok(CreatedBooking::AuthorizationPending(booking))
            }
            Err(e) => {
                warn!("Authorization for booking {} declined: {}", booking.id, e);
                Err(e)
            }
        }
    }

    /// Повтор авторизации для брони в `failed`. Ключ идемпотентности тот же,
    /// что и при создании, поэтому успевший пройти холд не задвоится.
    pub async fn retry_authorization(&self, id: Uuid) -> Result<Booking, PaymentError> {
        let now = Utc::now();
        let mut booking = self.get_booking(id).await?;
        if booking.payment_status != PaymentStatus::Failed {
            return Err(PaymentError::InvalidState(format!(
                "booking {id} has no failed authorization to retry (payment is {})",
                booking.payment_status
            )));
        }
        if !booking.status.is_open() {
            return Err(PaymentError::InvalidState(format!("booking {id} is {}", booking.status)));
        }
        ensure_transition(booking.payment_status, PaymentStatus::Authorized)?;

        let auth = booking
            .authorization
            .as_ref()
            .ok_or_else(|| PaymentError::InvalidState(format!("booking {id} has no deposit")))?;
        let request = AuthorizationRequest {
            booking_id: id,
            amount: auth.amount,
            currency: auth.currency.clone(),
            capture_method: auth.capture_method,
            idempotency_key: format!("{id}:authorize"),
        };

        let handle = self.retry.run("authorize", || self.gateway.authorize(&request)).await?;

        let mut patch = BookingPatch {
            authorization_handle: Some(handle),
            ..BookingPatch::default()
        }
        .stamp_payment(PaymentStatus::Authorized, now);
        if booking.status == BookingStatus::Pending {
            patch.status = Some(BookingStatus::Confirmed);
        }

        if !self.store.update_booking_conditional(id, booking.version, &patch).await? {
            // Вебхук authorization.succeeded мог успеть раньше
            let current = self.get_booking(id).await?;
            if current.payment_status == PaymentStatus::Authorized {
                return Ok(current);
            }
            return Err(PaymentError::ConcurrentUpdateConflict(id));
        }

        booking.apply(&patch, now);
        booking.version += 1;
        info!("Booking {} authorization retried successfully", id);
        dispatch(self.notifier.clone(), NotificationKind::Confirmed, booking.clone());
        Ok(booking)
    }
}
