use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::booking::{Booking, BookingPatch, BookingRow, PaymentStatus};
use crate::models::space::{Space, SpaceRow};

/// Хранилище броней - единственный источник правды о состоянии платежа.
/// Любая мутация идёт через `update_booking_conditional`.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_space(&self, id: Uuid) -> Result<Option<Space>, PaymentError>;

    async fn insert_booking(&self, booking: &Booking) -> Result<(), PaymentError>;

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, PaymentError>;

    async fn find_by_authorization(&self, handle: &str) -> Result<Option<Booking>, PaymentError>;

    /// Применяет патч, только если версия брони всё ещё `expected_version`.
    /// `false` означает, что бронь успел изменить кто-то другой.
    async fn update_booking_conditional(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &BookingPatch,
    ) -> Result<bool, PaymentError>;

    /// Ручные холды с датой не позже `on_or_before`, которые никто не разрешил.
    /// Бронь с захватом `pending_action` попадает в выборку, только если
    /// захват не обновлялся с `stale_before`.
    async fn list_unresolved_holds(
        &self,
        on_or_before: NaiveDate,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Booking>, PaymentError>;

    /// Отложенные (automatic) авторизации, которые пора списать.
    async fn list_deferred_due(
        &self,
        on_or_before: NaiveDate,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Booking>, PaymentError>;
}

const BOOKING_COLUMNS: &str = "id, space_id, date, start_time, end_time, party_size, base_price, \
     additional_services_price, total_price, status, payment_status, requires_payment, capture_method, \
     authorization_handle, deposit_amount, currency, captured_amount, authorized_at, captured_at, \
     released_at, refunded_at, pending_action, resolved_at, client_name, client_email, client_phone, \
     version, created_at, updated_at";

#[derive(Clone)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn list_authorized(
        &self,
        capture_method: &str,
        on_or_before: NaiveDate,
        stale_before: DateTime<Utc>,
        unresolved_only: bool,
    ) -> Result<Vec<Booking>, PaymentError> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE payment_status = $1
               AND capture_method = $2
               AND date <= $3
               AND (pending_action IS NULL OR updated_at < $4)
               AND status IN ('pending', 'confirmed')
               AND ($5 = FALSE OR resolved_at IS NULL)
             ORDER BY date, end_time"
        ))
        .bind(PaymentStatus::Authorized.as_str())
        .bind(capture_method)
        .bind(on_or_before)
        .bind(stale_before)
        .bind(unresolved_only)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Booking::try_from).collect()
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn get_space(&self, id: Uuid) -> Result<Option<Space>, PaymentError> {
        let row: Option<SpaceRow> = sqlx::query_as(
            "SELECT id, name, deposit_kind, deposit_percent, deposit_amount FROM spaces WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Space::try_from).transpose()
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), PaymentError> {
        let auth = booking.authorization.as_ref();
        let client = booking.client.as_ref();

        sqlx::query(
            "INSERT INTO bookings (
                id, space_id, date, start_time, end_time, party_size, base_price,
                additional_services_price, total_price, status, payment_status, requires_payment,
                capture_method, authorization_handle, deposit_amount, currency, authorized_at,
                client_name, client_email, client_phone, version, created_at, updated_at
             ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23
             )",
        )
        .bind(booking.id)
        .bind(booking.space_id)
        .bind(booking.date)
        .bind(booking.start_time)
        .bind(booking.end_time)
        .bind(booking.party_size)
        .bind(booking.base_price)
        .bind(booking.additional_services_price)
        .bind(booking.total_price)
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(booking.requires_payment)
        .bind(auth.map(|a| a.capture_method.as_str()))
        .bind(auth.and_then(|a| a.handle.clone()))
        .bind(auth.map(|a| a.amount))
        .bind(auth.map(|a| a.currency.clone()))
        .bind(auth.and_then(|a| a.authorized_at))
        .bind(client.and_then(|c| c.name.clone()))
        .bind(client.and_then(|c| c.email.clone()))
        .bind(client.and_then(|c| c.phone.clone()))
        .bind(booking.version)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, PaymentError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn find_by_authorization(&self, handle: &str) -> Result<Option<Booking>, PaymentError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE authorization_handle = $1"
        ))
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Booking::try_from).transpose()
    }

    async fn update_booking_conditional(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &BookingPatch,
    ) -> Result<bool, PaymentError> {
        // COALESCE: NULL в параметре значит "оставить как есть"
        let result = sqlx::query(
            "UPDATE bookings SET
                status = COALESCE($3, status),
                payment_status = COALESCE($4, payment_status),
                authorization_handle = COALESCE($5, authorization_handle),
                pending_action = CASE WHEN $6 THEN $7 ELSE pending_action END,
                resolved_at = COALESCE($8, resolved_at),
                authorized_at = COALESCE($9, authorized_at),
                captured_at = COALESCE($10, captured_at),
                captured_amount = COALESCE($11, captured_amount),
                released_at = COALESCE($12, released_at),
                refunded_at = COALESCE($13, refunded_at),
                version = version + 1,
                updated_at = NOW()
             WHERE id = $1 AND version = $2",
        )
        .bind(id)
        .bind(expected_version)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.payment_status.map(|s| s.as_str()))
        .bind(patch.authorization_handle.as_deref())
        .bind(patch.pending_action.is_some())
        .bind(patch.pending_action.flatten().map(|a| a.as_str()))
        .bind(patch.resolved_at)
        .bind(patch.authorized_at)
        .bind(patch.captured_at)
        .bind(patch.captured_amount)
        .bind(patch.released_at)
        .bind(patch.refunded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_unresolved_holds(
        &self,
        on_or_before: NaiveDate,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Booking>, PaymentError> {
        self.list_authorized("manual", on_or_before, stale_before, true).await
    }

    async fn list_deferred_due(
        &self,
        on_or_before: NaiveDate,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Booking>, PaymentError> {
        self.list_authorized("automatic", on_or_before, stale_before, false).await
    }
}
