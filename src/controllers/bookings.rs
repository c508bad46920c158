use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiResult, PaymentError};
use crate::middleware::{Capability, StaffUser};
use crate::models::booking::{Booking, BookingStatus, ClientContact, PaymentStatus};
use crate::services::orchestrator::{CreatedBooking, NewBooking};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/authorize", post(retry_authorization))
        .route("/bookings/{id}/mark-present", post(mark_present))
        .route("/bookings/{id}/mark-no-show", post(mark_no_show))
        .route("/bookings/{id}/confirm", post(confirm_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
}

/* ---------- request / response ---------- */

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingRequest {
    pub space_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[validate(range(min = 1, max = 500))]
    pub party_size: i32,
    #[validate(range(min = 0i64, max = 10_000_000_000i64))]
    pub base_price: i64,
    #[serde(default)]
    #[validate(range(min = 0i64, max = 10_000_000_000i64))]
    pub additional_services_price: i64,
    #[validate(length(min = 1, max = 200))]
    pub client_name: Option<String>,
    #[validate(email)]
    pub client_email: Option<String>,
    #[validate(length(min = 5, max = 32))]
    pub client_phone: Option<String>,
}

impl From<CreateBookingRequest> for NewBooking {
    fn from(req: CreateBookingRequest) -> Self {
        let client = if req.client_name.is_some() || req.client_email.is_some() || req.client_phone.is_some() {
            Some(ClientContact {
                name: req.client_name,
                email: req.client_email,
                phone: req.client_phone,
            })
        } else {
            None
        };
        NewBooking {
            space_id: req.space_id,
            date: req.date,
            start_time: req.start_time,
            end_time: req.end_time,
            party_size: req.party_size,
            base_price: req.base_price,
            additional_services_price: req.additional_services_price,
            client,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub booking_id: Uuid,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
}

impl From<&Booking> for ActionResponse {
    fn from(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            status: booking.status,
            payment_status: booking.payment_status,
        }
    }
}

/* ---------- handlers ---------- */

/// POST /bookings - публичная форма брони (гость или клиент)
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBookingRequest>,
) -> ApiResult<Response> {
    req.validate().map_err(PaymentError::from)?;

    let created = state.orchestrator.create_booking(req.into()).await?;
    let response = match created {
        CreatedBooking::Confirmed(booking) | CreatedBooking::NoDepositRequired(booking) => {
            (StatusCode::CREATED, Json(booking)).into_response()
        }
        // Бронь сохранена, авторизацию можно повторить через /authorize
        CreatedBooking::AuthorizationPending(booking) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "code": "GatewayUnavailable",
                "message": "payment gateway is unavailable, retry the authorization later",
                "bookingId": booking.id,
                "paymentStatus": booking.payment_status,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

/// GET /bookings/{id}
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    user: StaffUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Booking>> {
    user.require(Capability::ViewBookings)?;
    let booking = state.orchestrator.get_booking(id).await?;
    Ok(Json(booking))
}

/// POST /bookings/{id}/authorize - повтор авторизации после недоступности шлюза
pub async fn retry_authorization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    let booking = state.orchestrator.retry_authorization(id).await?;
    Ok(Json(ActionResponse::from(&booking)))
}

/// POST /bookings/{id}/mark-present
pub async fn mark_present(
    State(state): State<Arc<AppState>>,
    user: StaffUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    user.require(Capability::ManageBookings)?;
    tracing::info!("Staff {} marks booking {} present", user.email, id);
    let booking = state.resolutions.mark_present(id).await?;
    Ok(Json(ActionResponse::from(&booking)))
}

/// POST /bookings/{id}/mark-no-show
pub async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    user: StaffUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    user.require(Capability::ManageBookings)?;
    tracing::info!("Staff {} marks booking {} as no-show", user.email, id);
    let booking = state.resolutions.mark_no_show(id).await?;
    Ok(Json(ActionResponse::from(&booking)))
}

/// POST /bookings/{id}/confirm - для броней без депозита
pub async fn confirm_booking(
    State(state): State<Arc<AppState>>,
    user: StaffUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    user.require(Capability::ManageBookings)?;
    let booking = state.resolutions.confirm(id).await?;
    Ok(Json(ActionResponse::from(&booking)))
}

/// POST /bookings/{id}/cancel
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: StaffUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActionResponse>> {
    user.require(Capability::ManageBookings)?;
    tracing::info!("Staff {} cancels booking {}", user.email, id);
    let booking = state.resolutions.cancel(id).await?;
    Ok(Json(ActionResponse::from(&booking)))
}
