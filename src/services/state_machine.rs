//! Единственное место, где решается, как событие шлюза меняет бронь.
//!
//! Вебхуки, действия админа и фоновые sweep'ы проверяют переходы через
//! [`ensure_transition`]; вебхуки дополнительно идут через [`decide`].

use chrono::{DateTime, Utc};

use crate::error::PaymentError;
use crate::models::booking::{Booking, BookingPatch, BookingStatus, PaymentStatus};
use crate::models::webhook::GatewayEventKind;
use crate::services::notifications::NotificationKind;

pub fn ensure_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), PaymentError> {
    if from.can_transition_to(&to) {
        Ok(())
    } else {
        Err(PaymentError::InvalidStateTransition { from, to })
    }
}

/// Изменение брони, которое нужно записать условным обновлением.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub payment_status: Option<PaymentStatus>,
    pub booking_status: Option<BookingStatus>,
    pub captured_amount: Option<i64>,
    pub notify: Option<NotificationKind>,
}

impl Transition {
    pub fn patch(&self, now: DateTime<Utc>) -> BookingPatch {
        let mut patch = match self.payment_status {
            Some(status) => BookingPatch::default().stamp_payment(status, now),
            None => BookingPatch::default(),
        };
        patch.status = self.booking_status;
        patch.captured_amount = self.captured_amount;
        // Холд больше не в authorized: чужой захват действия уже неактуален
        if matches!(self.payment_status, Some(status) if status != PaymentStatus::Authorized) {
            patch.pending_action = Some(None);
        }
        patch
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Advance(Transition),
    /// Бронь уже в том состоянии, к которому ведёт событие.
    AlreadyApplied,
    ManualReview(String),
    /// Текущее состояние не допускает событие. Подтверждаем шлюзу и пишем в лог.
    Anomaly(String),
    Ignored,
}

fn advance(
    booking: &Booking,
    to: Option<PaymentStatus>,
    booking_status: Option<BookingStatus>,
    notify: Option<NotificationKind>,
) -> Decision {
    if let Some(to) = to {
        if let Err(err) = ensure_transition(booking.payment_status, to) {
            return Decision::Anomaly(err.to_string());
        }
    }
    Decision::Advance(Transition {
        payment_status: to,
        booking_status,
        captured_amount: None,
        notify,
    })
}

fn anomaly(booking: &Booking, kind: &GatewayEventKind) -> Decision {
    Decision::Anomaly(format!(
        "{kind:?} is not admitted while payment is {}",
        booking.payment_status
    ))
}

/// Решает, что делать с событием шлюза при текущем состоянии брони.
/// Чистая функция: повторная доставка того же события даёт `AlreadyApplied`.
pub fn decide(booking: &Booking, kind: &GatewayEventKind, amount: Option<i64>) -> Decision {
    use GatewayEventKind as K;
    use PaymentStatus as P;

    match (kind, booking.payment_status) {
        (K::AuthorizationSucceeded, P::Authorized) => {
            if booking.status == BookingStatus::Pending {
                advance(booking, None, Some(BookingStatus::Confirmed), Some(NotificationKind::Confirmed))
            } else {
                Decision::AlreadyApplied
            }
        }
        (K::AuthorizationSucceeded, P::Failed) => {
            let status = (booking.status == BookingStatus::Pending).then_some(BookingStatus::Confirmed);
            advance(booking, Some(P::Authorized), status, Some(NotificationKind::Confirmed))
        }

        (K::AuthorizationFailed, P::Authorized) => advance(booking, Some(P::Failed), None, None),
        (K::AuthorizationFailed, P::Failed) => Decision::AlreadyApplied,

        (K::CaptureSucceeded, P::Authorized) => {
            let Some(auth) = booking.authorization.as_ref() else {
                return anomaly(booking, kind);
            };
            let captured = amount.unwrap_or(auth.amount);
            if captured > auth.amount {
                return Decision::Anomaly(format!(
                    "captured amount {captured} exceeds authorized {}",
                    auth.amount
                ));
            }
            match advance(
                booking,
                Some(P::settled_by(auth.capture_method)),
                None,
                Some(NotificationKind::Captured),
            ) {
                Decision::Advance(mut transition) => {
                    transition.captured_amount = Some(captured);
                    Decision::Advance(transition)
                }
                other => other,
            }
        }
        (K::CaptureSucceeded, P::Captured | P::Paid) => Decision::AlreadyApplied,

        (K::CaptureFailed, P::Authorized) => Decision::ManualReview(format!(
            "capture failed for booking {}, hold is still authorized",
            booking.id
        )),

        (K::ReleaseSucceeded, P::Authorized) => {
            advance(booking, Some(P::Released), None, Some(NotificationKind::Released))
        }
        (K::ReleaseSucceeded, P::Released) => Decision::AlreadyApplied,

        (K::RefundSucceeded, P::Authorized | P::Captured | P::Paid) => {
            advance(booking, Some(P::Refunded), None, Some(NotificationKind::Refunded))
        }
        (K::RefundSucceeded, P::Refunded) => Decision::AlreadyApplied,

        (K::Unknown(_), _) => Decision::Ignored,
        _ => anomaly(booking, kind),
    }
}
