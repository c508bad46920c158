use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::booking::PaymentStatus;

/// Ошибки платёжного контура. Повтор операции имеет смысл только для
/// `is_transient()`; всё остальное отдаётся вызывающему сразу.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("webhook signature rejected: {0}")]
    SignatureInvalid(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Действие не допускается текущим состоянием брони (например, она уже разрешена).
    #[error("{0}")]
    InvalidState(String),

    #[error("illegal payment transition {from} -> {to}")]
    InvalidStateTransition { from: PaymentStatus, to: PaymentStatus },

    #[error("payment declined: {reason}")]
    GatewayRejected { code: Option<String>, reason: String },

    #[error("authorization already captured")]
    AlreadyCaptured,

    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("booking {0} was modified concurrently")]
    ConcurrentUpdateConflict(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("idempotency ledger error: {0}")]
    Ledger(String),
}

impl From<redis::RedisError> for PaymentError {
    fn from(err: redis::RedisError) -> Self {
        PaymentError::Ledger(err.to_string())
    }
}

impl From<validator::ValidationErrors> for PaymentError {
    fn from(err: validator::ValidationErrors) -> Self {
        PaymentError::Validation(err.to_string())
    }
}

impl PaymentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::ConcurrentUpdateConflict(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SignatureInvalid(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) | Self::InvalidStateTransition { .. } | Self::AlreadyCaptured => {
                StatusCode::CONFLICT
            }
            Self::GatewayRejected { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::GatewayUnavailable(_) | Self::ConcurrentUpdateConflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Машиночитаемый код ошибки для тела ответа.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid(_) => "SignatureInvalid",
            Self::NotFound(_) => "NotFound",
            Self::InvalidState(_) | Self::InvalidStateTransition { .. } | Self::AlreadyCaptured => "InvalidState",
            Self::GatewayRejected { .. } => "GatewayRejected",
            Self::GatewayUnavailable(_) => "GatewayUnavailable",
            Self::ConcurrentUpdateConflict(_) => "ConcurrentUpdateConflict",
            Self::Validation(_) => "ValidationFailed",
            Self::Storage(_) | Self::Ledger(_) => "InternalError",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
}

pub type ApiFailure = (StatusCode, Json<ApiError>);
pub type ApiResult<T> = Result<T, ApiFailure>;

pub fn to_api_error(status: StatusCode, code: &'static str, message: &str) -> ApiFailure {
    (
        status,
        Json(ApiError {
            success: false,
            code,
            message: message.to_string(),
        }),
    )
}

impl From<PaymentError> for ApiFailure {
    fn from(err: PaymentError) -> Self {
        // Подробности внутренних ошибок остаются в логах
        let message = match &err {
            PaymentError::Storage(_) | PaymentError::Ledger(_) => {
                tracing::error!("Internal error: {}", err);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        to_api_error(err.status_code(), err.code(), &message)
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        ApiFailure::from(self).into_response()
    }
}
