use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PaymentError;

/// Статус бронирования (посещаемость и жизненный цикл брони).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::NoShow => "no_show",
        }
    }

    /// Бронь ещё может быть отменена или подтверждена.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl FromStr for BookingStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "no_show" => Ok(Self::NoShow),
            other => Err(PaymentError::Validation(format!("unknown booking status: {other}"))),
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Состояние депозита. Допустимые переходы перечислены в `can_transition_to`,
/// всё остальное запрещено.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    NotRequired,
    Authorized,
    /// Отложенное (automatic) списание выполнено.
    Paid,
    /// Ручной холд списан (неявка).
    Captured,
    Released,
    Refunded,
    Failed,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 7] = [
        Self::NotRequired,
        Self::Authorized,
        Self::Paid,
        Self::Captured,
        Self::Released,
        Self::Refunded,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::Authorized => "authorized",
            Self::Paid => "paid",
            Self::Captured => "captured",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Authorized, Self::Captured)
                | (Self::Authorized, Self::Paid)
                | (Self::Authorized, Self::Released)
                | (Self::Authorized, Self::Failed)
                | (Self::Authorized, Self::Refunded)
                | (Self::Captured, Self::Refunded)
                | (Self::Paid, Self::Refunded)
                | (Self::Failed, Self::Authorized)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotRequired | Self::Released | Self::Refunded)
    }

    /// Во что превращается авторизация после успешного списания.
    pub fn settled_by(method: CaptureMethod) -> Self {
        match method {
            CaptureMethod::Manual => Self::Captured,
            CaptureMethod::Automatic => Self::Paid,
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PaymentError::Validation(format!("unknown payment status: {s}")))
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Холд создаётся сразу и разрешается нашей логикой посещаемости.
    Manual,
    /// Согласие на списание сохраняется сейчас, деньги списываются ближе к дате.
    Automatic,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }
}

impl FromStr for CaptureMethod {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "automatic" => Ok(Self::Automatic),
            other => Err(PaymentError::Validation(format!("unknown capture method: {other}"))),
        }
    }
}

/// Действие со шлюзом, которое сейчас выполняет один из участников
/// (админ или фоновый sweep). Пока оно записано, второй участник шлюз не трогает.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingAction {
    Capture,
    Release,
    Refund,
}

impl PendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Release => "release",
            Self::Refund => "refund",
        }
    }
}

impl FromStr for PendingAction {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capture" => Ok(Self::Capture),
            "release" => Ok(Self::Release),
            "refund" => Ok(Self::Refund),
            other => Err(PaymentError::Validation(format!("unknown pending action: {other}"))),
        }
    }
}

/// Авторизация депозита в шлюзе. Суммы в минимальных единицах валюты.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    /// Идентификатор payment/setup intent. `None`, если шлюз был недоступен
    /// при создании брони и авторизацию ещё предстоит повторить.
    pub handle: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub capture_method: CaptureMethod,
    pub captured_amount: Option<i64>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub space_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub party_size: i32,
    pub base_price: i64,
    pub additional_services_price: i64,
    pub total_price: i64,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub requires_payment: bool,
    pub authorization: Option<PaymentAuthorization>,
    pub pending_action: Option<PendingAction>,
    /// Момент ручного или автоматического разрешения посещаемости.
    pub resolved_at: Option<DateTime<Utc>>,
    pub client: Option<ClientContact>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn capture_method(&self) -> Option<CaptureMethod> {
        self.authorization.as_ref().map(|auth| auth.capture_method)
    }

    pub fn authorization_handle(&self) -> Option<&str> {
        self.authorization.as_ref().and_then(|auth| auth.handle.as_deref())
    }

    /// Применяет патч к локальной копии так же, как это делает хранилище.
    /// Версию не трогает: её увеличивает само хранилище.
    pub fn apply(&mut self, patch: &BookingPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(payment_status) = patch.payment_status {
            self.payment_status = payment_status;
        }
        if let Some(pending) = patch.pending_action {
            self.pending_action = pending;
        }
        if let Some(resolved_at) = patch.resolved_at {
            self.resolved_at = Some(resolved_at);
        }
        if let Some(auth) = self.authorization.as_mut() {
            if let Some(handle) = &patch.authorization_handle {
                auth.handle = Some(handle.clone());
            }
            if patch.authorized_at.is_some() {
                auth.authorized_at = patch.authorized_at;
            }
            if patch.captured_at.is_some() {
                auth.captured_at = patch.captured_at;
            }
            if patch.captured_amount.is_some() {
                auth.captured_amount = patch.captured_amount;
            }
            if patch.released_at.is_some() {
                auth.released_at = patch.released_at;
            }
            if patch.refunded_at.is_some() {
                auth.refunded_at = patch.refunded_at;
            }
        }
        self.updated_at = now;
    }
}

/// Частичное обновление брони для условной записи. `None` значит "не менять".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub authorization_handle: Option<String>,
    /// `Some(None)` снимает захват действия.
    pub pending_action: Option<Option<PendingAction>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub captured_amount: Option<i64>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl BookingPatch {
    /// Проставляет метку времени, соответствующую новому статусу платежа.
    pub fn stamp_payment(mut self, status: PaymentStatus, now: DateTime<Utc>) -> Self {
        self.payment_status = Some(status);
        match status {
            PaymentStatus::Authorized => self.authorized_at = Some(now),
            PaymentStatus::Captured | PaymentStatus::Paid => self.captured_at = Some(now),
            PaymentStatus::Released => self.released_at = Some(now),
            PaymentStatus::Refunded => self.refunded_at = Some(now),
            PaymentStatus::NotRequired | PaymentStatus::Failed => {}
        }
        self
    }
}

// Строка таблицы bookings как она лежит в Postgres
#[derive(Debug, Clone, FromRow)]
pub struct BookingRow {
    pub id: Uuid,
    pub space_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub party_size: i32,
    pub base_price: i64,
    pub additional_services_price: i64,
    pub total_price: i64,
    pub status: String,
    pub payment_status: String,
    pub requires_payment: bool,
    pub capture_method: Option<String>,
    pub authorization_handle: Option<String>,
    pub deposit_amount: Option<i64>,
    pub currency: Option<String>,
    pub captured_amount: Option<i64>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub pending_action: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub client_phone: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = PaymentError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let authorization = match (row.capture_method, row.deposit_amount) {
            (Some(method), Some(amount)) => Some(PaymentAuthorization {
                handle: row.authorization_handle,
                amount,
                currency: row.currency.unwrap_or_default(),
                capture_method: method.parse()?,
                captured_amount: row.captured_amount,
                authorized_at: row.authorized_at,
                captured_at: row.captured_at,
                released_at: row.released_at,
                refunded_at: row.refunded_at,
            }),
            _ => None,
        };

        let client = if row.client_name.is_some() || row.client_email.is_some() || row.client_phone.is_some() {
            Some(ClientContact {
                name: row.client_name,
                email: row.client_email,
                phone: row.client_phone,
            })
        } else {
            None
        };

        Ok(Booking {
            id: row.id,
            space_id: row.space_id,
            date: row.date,
            start_time: row.start_time,
            end_time: row.end_time,
            party_size: row.party_size,
            base_price: row.base_price,
            additional_services_price: row.additional_services_price,
            total_price: row.total_price,
            status: row.status.parse()?,
            payment_status: row.payment_status.parse()?,
            requires_payment: row.requires_payment,
            authorization,
            pending_action: row.pending_action.as_deref().map(str::parse::<PendingAction>).transpose()?,
            resolved_at: row.resolved_at,
            client,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
