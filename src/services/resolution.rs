//! Разрешение депозита действиями админа и фоновых задач: присутствие,
//! неявка, подтверждение, отмена и отложенное списание.
//!
//! Перед вызовом шлюза действие захватывается записью `pending_action`
//! (условное обновление), поэтому один и тот же холд не трогают два
//! локальных участника сразу. Вебхук может обогнать синхронный ответ шлюза:
//! проигравший перечитывает бронь и либо сходится к тому же итогу, либо
//! получает `InvalidState`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::booking::{Booking, BookingPatch, BookingStatus, CaptureMethod, PaymentStatus, PendingAction};
use crate::services::gateway::PaymentGateway;
use crate::services::notifications::{dispatch, NotificationKind, Notifier};
use crate::services::retry::RetryPolicy;
use crate::services::state_machine::ensure_transition;
use crate::services::store::BookingStore;

// Захват старше этого считается брошенным (процесс упал посреди вызова шлюза)
const STALE_CLAIM_MINS: i64 = 10;

/// Захваты, обновлённые раньше этого момента, можно перехватывать.
pub fn stale_claim_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - ChronoDuration::minutes(STALE_CLAIM_MINS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    MarkPresent,
    MarkNoShow,
    Confirm,
    Cancel,
    PreCharge,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarkPresent => "mark_present",
            Self::MarkNoShow => "mark_no_show",
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
            Self::PreCharge => "pre_charge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Plan {
    /// Меняется только статус брони, шлюз не нужен.
    Direct {
        booking_status: BookingStatus,
        resolves: bool,
        notify: NotificationKind,
    },
    Gateway {
        action: PendingAction,
        target: PaymentStatus,
        booking_status: Option<BookingStatus>,
        resolves: bool,
        notify: NotificationKind,
    },
}

fn already_resolved(booking: &Booking) -> PaymentError {
    PaymentError::InvalidState(format!(
        "booking {} is already resolved (status {}, payment {})",
        booking.id, booking.status, booking.payment_status
    ))
}

fn plan(op: Operation, booking: &Booking) -> Result<Plan, PaymentError> {
    use PaymentStatus as P;

    if !booking.status.is_open() {
        return Err(already_resolved(booking));
    }

    match op {
        Operation::MarkPresent | Operation::MarkNoShow => {
            if booking.resolved_at.is_some() {
                return Err(already_resolved(booking));
            }
            let (booking_status, notify) = match op {
                Operation::MarkPresent => (BookingStatus::Completed, NotificationKind::Confirmed),
                _ => (BookingStatus::NoShow, NotificationKind::NoShow),
            };
            match booking.payment_status {
                P::Authorized => {
                    let method = booking.capture_method().unwrap_or(CaptureMethod::Manual);
                    let (action, target) = match op {
                        Operation::MarkPresent => (PendingAction::Release, P::Released),
                        _ => (PendingAction::Capture, P::settled_by(method)),
                    };
                    Ok(Plan::Gateway {
                        action,
                        target,
                        booking_status: Some(booking_status),
                        resolves: true,
                        notify,
                    })
                }
                P::NotRequired => Ok(Plan::Direct { booking_status, resolves: true, notify }),
                _ => Err(already_resolved(booking)),
            }
        }
        Operation::Confirm => {
            if booking.status != BookingStatus::Pending {
                return Err(PaymentError::InvalidState(format!(
                    "booking {} is already {}",
                    booking.id, booking.status
                )));
            }
            match booking.payment_status {
                P::NotRequired | P::Authorized => Ok(Plan::Direct {
                    booking_status: BookingStatus::Confirmed,
                    resolves: false,
                    notify: NotificationKind::Confirmed,
                }),
                other => Err(PaymentError::InvalidState(format!(
                    "booking {} cannot be confirmed while payment is {}",
                    booking.id, other
                ))),
            }
        }
        Operation::Cancel => {
            let refund_or_release = |action, target| Plan::Gateway {
                action,
                target,
                booking_status: Some(BookingStatus::Cancelled),
                resolves: false,
                notify: NotificationKind::Cancelled,
            };
            Ok(match booking.payment_status {
                P::Authorized => refund_or_release(PendingAction::Release, P::Released),
                P::Captured | P::Paid => refund_or_release(PendingAction::Refund, P::Refunded),
                P::NotRequired | P::Failed | P::Released | P::Refunded => Plan::Direct {
                    booking_status: BookingStatus::Cancelled,
                    resolves: false,
                    notify: NotificationKind::Cancelled,
                },
            })
        }
        Operation::PreCharge => match (booking.payment_status, booking.capture_method()) {
            (P::Authorized, Some(CaptureMethod::Automatic)) => Ok(Plan::Gateway {
                action: PendingAction::Capture,
                target: P::Paid,
                booking_status: None,
                resolves: false,
                notify: NotificationKind::Captured,
            }),
            _ => Err(PaymentError::InvalidState(format!(
                "booking {} has no deferred authorization to charge (payment {})",
                booking.id, booking.payment_status
            ))),
        },
    }
}

pub struct ResolutionService {
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl ResolutionService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, gateway, notifier, retry }
    }

    pub async fn mark_present(&self, id: Uuid) -> Result<Booking, PaymentError> {
        self.run(Operation::MarkPresent, id).await
    }

    pub async fn mark_no_show(&self, id: Uuid) -> Result<Booking, PaymentError> {
        self.run(Operation::MarkNoShow, id).await
    }

    pub async fn confirm(&self, id: Uuid) -> Result<Booking, PaymentError> {
        self.run(Operation::Confirm, id).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Booking, PaymentError> {
        self.run(Operation::Cancel, id).await
    }

    async fn load(&self, id: Uuid) -> Result<Booking, PaymentError> {
        self.store
            .get_booking(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("booking {id}")))
    }

    async fn run(&self, op: Operation, id: Uuid) -> Result<Booking, PaymentError> {
        self.run_at(op, id, Utc::now()).await
    }

    /// `now` задаёт часы для проверки брошенного захвата; фоновые задачи
    /// передают своё время, чтобы выборка и перехват сходились.
    pub(crate) async fn run_at(&self, op: Operation, id: Uuid, now: DateTime<Utc>) -> Result<Booking, PaymentError> {
        let booking = self.load(id).await?;
        let plan = plan(op, &booking)?;
        let result = match plan {
            Plan::Direct { booking_status, resolves, notify } => {
                self.finish_direct(op, booking, booking_status, resolves, notify).await
            }
            Plan::Gateway { .. } => self.settle(op, booking, plan, now).await,
        };
        if let Err(e) = &result {
            warn!("{} on booking {} failed: {}", op.as_str(), id, e);
        }
        result
    }

    async fn finish_direct(
        &self,
        op: Operation,
        mut booking: Booking,
        booking_status: BookingStatus,
        resolves: bool,
        notify: NotificationKind,
    ) -> Result<Booking, PaymentError> {
        let now = Utc::now();
        let patch = BookingPatch {
            status: Some(booking_status),
            resolved_at: resolves.then_some(now),
            ..BookingPatch::default()
        };
        if !self.store.update_booking_conditional(booking.id, booking.version, &patch).await? {
            return Err(PaymentError::ConcurrentUpdateConflict(booking.id));
        }
        booking.apply(&patch, now);
        booking.version += 1;
        info!("{}: booking {} is now {}", op.as_str(), booking.id, booking.status);
        dispatch(self.notifier.clone(), notify, booking.clone());
        Ok(booking)
    }

    /// Захват действия. После конфликта бронь перечитывается один раз.
    async fn claim(
        &self,
        op: Operation,
        mut booking: Booking,
        action: PendingAction,
        now: DateTime<Utc>,
    ) -> Result<Booking, PaymentError> {
        for attempt in 0..2 {
            if attempt > 0 {
                booking = self.load(booking.id).await?;
                // Состояние могло уйти дальше, план пересчитывается заново
                plan(op, &booking)?;
            }
            if let Some(in_flight) = booking.pending_action {
                if booking.updated_at > stale_claim_cutoff(now) {
                    return Err(PaymentError::InvalidState(format!(
                        "booking {} already has a {} in progress",
                        booking.id,
                        in_flight.as_str()
                    )));
                }
                warn!("Reclaiming stale {} on booking {}", in_flight.as_str(), booking.id);
            }

            let patch = BookingPatch {
                pending_action: Some(Some(action)),
                ..BookingPatch::default()
            };
            if self.store.update_booking_conditional(booking.id, booking.version, &patch).await? {
                booking.apply(&patch, now);
                booking.version += 1;
                return Ok(booking);
            }
        }
        Err(PaymentError::ConcurrentUpdateConflict(booking.id))
    }

    async fn call_gateway(&self, action: PendingAction, booking: &Booking) -> Result<Option<i64>, PaymentError> {
        let handle = booking
            .authorization_handle()
            .ok_or_else(|| PaymentError::InvalidState(format!("booking {} has no authorization handle", booking.id)))?;
        // Ключ стабилен для брони и действия: повтор после таймаута безопасен
        let key = format!("{}:{}", booking.id, action.as_str());

        match action {
            PendingAction::Capture => {
                let captured = self
                    .retry
                    .run("capture", || self.gateway.capture(handle, &key))
                    .await;
                match captured {
                    Ok(object) => Ok(object.amount),
                    Err(PaymentError::AlreadyCaptured) => {
                        info!("Authorization {} was already captured, converging", handle);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            PendingAction::Release => {
                self.retry.run("release", || self.gateway.release(handle, &key)).await?;
                Ok(None)
            }
            PendingAction::Refund => {
                self.retry
                    .run("refund", || self.gateway.refund(handle, None, &key))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn settle(
        &self,
        op: Operation,
        booking: Booking,
        plan: Plan,
        claimed_at: DateTime<Utc>,
    ) -> Result<Booking, PaymentError> {
        let Plan::Gateway { action, target, booking_status, resolves, notify } = plan else {
            return Err(PaymentError::InvalidState(format!("{} needs no gateway call", op.as_str())));
        };
        ensure_transition(booking.payment_status, target)?;

        let mut booking = self.claim(op, booking, action, claimed_at).await?;

        let gateway_amount = match self.call_gateway(action, &booking).await {
            Ok(amount) => amount,
            Err(e) => {
                let release_claim = BookingPatch {
                    pending_action: Some(None),
                    ..BookingPatch::default()
                };
                // Если бронь уже изменил вебхук, захват он и снял
                if let Err(store_err) = self
                    .store
                    .update_booking_conditional(booking.id, booking.version, &release_claim)
                    .await
                {
                    warn!(
                        "Could not clear {} claim on booking {}: {}; the next sweep reclaims it once stale",
                        action.as_str(),
                        booking.id,
                        store_err
                    );
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut patch = BookingPatch {
            status: booking_status,
            resolved_at: resolves.then_some(now),
            pending_action: Some(None),
            ..BookingPatch::default()
        }
        .stamp_payment(target, now);
        if action == PendingAction::Capture {
            let authorized = booking.authorization.as_ref().map(|a| a.amount);
            patch.captured_amount = gateway_amount.or(authorized).map(|amount| match authorized {
                Some(limit) => amount.min(limit),
                None => amount,
            });
        }

        if self.store.update_booking_conditional(booking.id, booking.version, &patch).await? {
            let from = booking.payment_status;
            booking.apply(&patch, now);
            booking.version += 1;
            info!(
                "{}: booking {} payment {} -> {}, status {}",
                op.as_str(),
                booking.id,
                from,
                booking.payment_status,
                booking.status
            );
            dispatch(self.notifier.clone(), notify, booking.clone());
            return Ok(booking);
        }

        self.converge(op, booking.id, target, booking_status, resolves, notify).await
    }

    // Вебхук успел записать итог раньше синхронного ответа шлюза
    async fn converge(
        &self,
        op: Operation,
        id: Uuid,
        target: PaymentStatus,
        booking_status: Option<BookingStatus>,
        resolves: bool,
        notify: NotificationKind,
    ) -> Result<Booking, PaymentError> {
        let mut current = self.load(id).await?;
        let now = Utc::now();

        if current.payment_status != target {
            let clear = BookingPatch {
                pending_action: Some(None),
                ..BookingPatch::default()
            };
            if current.pending_action.is_some() {
                if let Err(e) = self.store.update_booking_conditional(id, current.version, &clear).await {
                    warn!("Could not clear claim on booking {}: {}", id, e);
                }
            }
            return Err(PaymentError::InvalidState(format!(
                "booking {} was resolved concurrently (payment is {})",
                id, current.payment_status
            )));
        }

        let patch = BookingPatch {
            status: booking_status.filter(|status| *status != current.status),
            resolved_at: if resolves && current.resolved_at.is_none() { Some(now) } else { None },
            pending_action: Some(None),
            ..BookingPatch::default()
        };
        if !self.store.update_booking_conditional(id, current.version, &patch).await? {
            return Err(PaymentError::ConcurrentUpdateConflict(id));
        }
        current.apply(&patch, now);
        current.version += 1;
        info!(
            "{}: booking {} converged with gateway notification (payment {})",
            op.as_str(),
            id,
            current.payment_status
        );
        dispatch(self.notifier.clone(), notify, current.clone());
        Ok(current)
    }
}
