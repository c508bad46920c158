use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
};
use base64::{engine::general_purpose, Engine as _};
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{to_api_error, ApiFailure, PaymentError};

/// Что разрешено сотруднику на админских эндпоинтах.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ViewBookings,
    ManageBookings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffRole {
    Admin,
    Manager,
    Viewer,
}

impl StaffRole {
    pub fn grants(&self, capability: Capability) -> bool {
        match self {
            Self::Admin | Self::Manager => true,
            Self::Viewer => capability == Capability::ViewBookings,
        }
    }
}

impl FromStr for StaffRole {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "manager" => Ok(Self::Manager),
            "viewer" => Ok(Self::Viewer),
            other => Err(PaymentError::Validation(format!("unknown staff role: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaffAccount {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: StaffRole,
}

#[async_trait]
pub trait StaffDirectory: Send + Sync {
    async fn find_active(&self, email: &str) -> Result<Option<StaffAccount>, PaymentError>;
}

// Структура для результата из БД
#[derive(sqlx::FromRow)]
struct StaffRow {
    id: Uuid,
    email: String,
    password_hash: String,
    role: String,
}

pub struct PgStaffDirectory {
    pool: PgPool,
}

impl PgStaffDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StaffDirectory for PgStaffDirectory {
    async fn find_active(&self, email: &str) -> Result<Option<StaffAccount>, PaymentError> {
        let row: Option<StaffRow> = sqlx::query_as(
            "SELECT id, email, password_hash, role
             FROM staff
             WHERE email = $1 AND is_active = true",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<StaffAccount, PaymentError> {
            Ok(StaffAccount {
                id: r.id,
                email: r.email,
                password_hash: r.password_hash,
                role: r.role.parse()?,
            })
        })
        .transpose()
    }
}

#[derive(Debug, Clone)]
pub struct StaffUser {
    pub id: Uuid,
    pub email: String,
    pub role: StaffRole,
}

impl StaffUser {
    pub fn require(&self, capability: Capability) -> Result<(), ApiFailure> {
        if self.role.grants(capability) {
            Ok(())
        } else {
            warn!("Staff {} denied {:?}", self.email, capability);
            Err(to_api_error(StatusCode::FORBIDDEN, "Forbidden", "insufficient permissions"))
        }
    }
}

fn unauthorized() -> ApiFailure {
    to_api_error(StatusCode::UNAUTHORIZED, "Unauthorized", "valid staff credentials required")
}

// Basic Auth extractor
impl FromRequestParts<Arc<crate::AppState>> for StaffUser {
    type Rejection = ApiFailure;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<crate::AppState>) -> Result<Self, Self::Rejection> {
        // Получаем заголовок Authorization
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(unauthorized)?;

        // Проверяем что это Basic auth
        let encoded = auth_header.strip_prefix("Basic ").ok_or_else(unauthorized)?;

        // Декодируем base64
        let decoded = general_purpose::STANDARD.decode(encoded).map_err(|_| unauthorized())?;
        let credentials = String::from_utf8(decoded).map_err(|_| unauthorized())?;

        // Разделяем email:password
        let (email, password) = credentials.split_once(':').ok_or_else(unauthorized)?;

        let account = state
            .staff
            .find_active(email)
            .await
            .map_err(ApiFailure::from)?
            .ok_or_else(unauthorized)?;

        // bcrypt намеренно медленный, не держим им рантайм
        let password = password.to_string();
        let hash = account.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| {
                error!("Password verification task failed: {}", e);
                to_api_error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "internal error")
            })?
            .unwrap_or(false);

        if !verified {
            return Err(unauthorized());
        }

        Ok(StaffUser {
            id: account.id,
            email: account.email,
            role: account.role,
        })
    }
}
