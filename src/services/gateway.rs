//! gateway.rs
//!
//! Клиент внешнего платёжного шлюза.
//!
//! 1.  **CircuitBreaker**: защищает от лавины запросов к неработающему шлюзу.
//!     Считает только временные сбои (таймауты, 5xx); отказ по карте шлюз
//!     выдаёт штатно, и выключатель его не учитывает.
//! 2.  **PaymentGateway**: контракт шлюза, за которым прячется HTTP-клиент
//!     (и фейки в тестах).
//! 3.  **verify_signature**: проверка подписи вебхука, fail closed.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CircuitBreakerConfig, PaymentConfig};
use crate::error::PaymentError;
use crate::models::booking::CaptureMethod;
use crate::models::webhook::GatewayEvent;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

type HmacSha256 = Hmac<Sha256>;

/// Состояния "Автоматического выключателя" (Circuit Breaker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Нормальный режим работы, запросы разрешены.
    Closed,
    /// Запросы запрещены до истечения таймаута.
    Open,
    /// Пробный режим после таймаута: успех замыкает цепь, сбой снова размыкает.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    failure_threshold: u32,
    timeout_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            timeout_duration: timeout,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_secs(config.timeout_seconds))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Проверяет, можно ли выполнить следующий запрос к шлюзу.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.timeout_duration);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker transitioning to HalfOpen state");
                }
                expired
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit breaker recovered - transitioning to Closed state");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                error!(
                    "Circuit breaker OPENED - {} failures reached threshold {}",
                    inner.failure_count, self.failure_threshold
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("Circuit breaker test failed - returning to Open state");
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub fn get_state(&self) -> CircuitState {
        self.lock().state
    }
}

// --- Подпись вебхуков ---

/// Формирует заголовок подписи `t=<unix>,v1=<hex hmac>` для тела `body`.
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, PaymentError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::SignatureInvalid("unusable webhook secret".into()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes())))
}

/// Проверяет подпись сырого тела и только после этого разбирает событие.
/// Любая неоднозначность трактуется как отказ.
pub fn verify_signature(
    raw_body: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<GatewayEvent, PaymentError> {
    if secret.is_empty() {
        return Err(PaymentError::SignatureInvalid("webhook secret is not configured".into()));
    }

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| PaymentError::SignatureInvalid("malformed timestamp".into()))?,
                )
            }
            Some(("v1", value)) => signatures.push(value),
            Some(_) => {}
            None => return Err(PaymentError::SignatureInvalid("malformed signature header".into())),
        }
    }

    let timestamp = timestamp.ok_or_else(|| PaymentError::SignatureInvalid("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(PaymentError::SignatureInvalid("missing v1 signature".into()));
    }
    if (now - timestamp).abs() > tolerance_secs {
        return Err(PaymentError::SignatureInvalid("timestamp outside tolerance".into()));
    }

    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    });
    if !matched {
        return Err(PaymentError::SignatureInvalid("signature mismatch".into()));
    }

    serde_json::from_slice(raw_body)
        .map_err(|e| PaymentError::SignatureInvalid(format!("signed payload is not a gateway event: {e}")))
}

// --- Контракт шлюза ---

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub booking_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub capture_method: CaptureMethod,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn verify_signature(&self, raw_body: &[u8], header: &str) -> Result<GatewayEvent, PaymentError>;

    /// Создаёт холд (manual) или сохраняет согласие на списание (automatic).
    /// Возвращает ссылку на авторизацию.
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<String, PaymentError>;

    /// Повторный вызов для уже списанной авторизации даёт `AlreadyCaptured`.
    async fn capture(&self, handle: &str, idempotency_key: &str) -> Result<GatewayObject, PaymentError>;

    async fn release(&self, handle: &str, idempotency_key: &str) -> Result<GatewayObject, PaymentError>;

    async fn refund(
        &self,
        handle: &str,
        amount: Option<i64>,
        idempotency_key: &str,
    ) -> Result<GatewayObject, PaymentError>;
}

#[derive(Debug, Serialize)]
struct AuthorizeBody<'a> {
    amount: i64,
    currency: &'a str,
    capture_method: CaptureMethod,
    metadata: AuthorizeMetadata,
}

#[derive(Debug, Serialize)]
struct AuthorizeMetadata {
    booking_id: Uuid,
}

#[derive(Debug, Serialize)]
struct RefundBody<'a> {
    authorization_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP-клиент шлюза. Все вызовы проходят через `CircuitBreaker`
/// и несут заголовок `Idempotency-Key`.
pub struct HttpGatewayClient {
    base_url: String,
    api_key: String,
    webhook_secret: String,
    signature_tolerance_secs: i64,
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
}

impl HttpGatewayClient {
    pub fn from_config(config: &PaymentConfig, breaker: &CircuitBreakerConfig) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            signature_tolerance_secs: config.signature_tolerance_secs,
            http_client,
            circuit_breaker: CircuitBreaker::from_config(breaker),
        })
    }

    #[cfg(test)]
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.get_state()
    }

    fn post(&self, path: &str, idempotency_key: &str) -> reqwest::RequestBuilder {
        self.http_client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
    }

    /// Выполняет запрос, пропуская его через Circuit Breaker.
    async fn execute_with_circuit_breaker(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<GatewayObject, PaymentError> {
        if !self.circuit_breaker.can_execute() {
            warn!("Circuit breaker is OPEN - blocking gateway {} request", operation);
            return Err(PaymentError::GatewayUnavailable("circuit breaker is open".into()));
        }

        let result = Self::send(request).await;
        match &result {
            Err(e) if e.is_transient() => {
                error!("Gateway {} request failed: {}", operation, e);
                self.circuit_breaker.record_failure();
            }
            _ => self.circuit_breaker.record_success(),
        }
        result
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<GatewayObject, PaymentError> {
        // Таймаут не означает, что операция не прошла - только что мы не знаем исход
        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<GatewayObject>()
                .await
                .map_err(|e| PaymentError::GatewayUnavailable(format!("unreadable gateway response: {e}")));
        }

        let body = response.json::<GatewayErrorBody>().await.unwrap_or_default();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PaymentError::GatewayUnavailable(format!(
                "gateway answered {}",
                status.as_u16()
            )));
        }
        if status == reqwest::StatusCode::CONFLICT && body.code.as_deref() == Some("already_captured") {
            return Err(PaymentError::AlreadyCaptured);
        }
        Err(PaymentError::GatewayRejected {
            reason: body.message.unwrap_or_else(|| format!("gateway answered {}", status.as_u16())),
            code: body.code,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGatewayClient {
    fn verify_signature(&self, raw_body: &[u8], header: &str) -> Result<GatewayEvent, PaymentError> {
        verify_signature(
            raw_body,
            header,
            &self.webhook_secret,
            self.signature_tolerance_secs,
            chrono::Utc::now().timestamp(),
        )
    }

    async fn authorize(&self, request: &AuthorizationRequest) -> Result<String, PaymentError> {
        info!(
            "Authorizing deposit: booking={}, amount={}, currency={}, method={}",
            request.booking_id,
            request.amount,
            request.currency,
            request.capture_method.as_str()
        );
        let body = AuthorizeBody {
            amount: request.amount,
            currency: &request.currency,
            capture_method: request.capture_method,
            metadata: AuthorizeMetadata { booking_id: request.booking_id },
        };
        let builder = self.post("/v1/authorizations", &request.idempotency_key).json(&body);
        let object = self.execute_with_circuit_breaker("authorize", builder).await?;
        Ok(object.id)
    }

    async fn capture(&self, handle: &str, idempotency_key: &str) -> Result<GatewayObject, PaymentError> {
        info!("Capturing authorization {}", handle);
        let builder = self.post(&format!("/v1/authorizations/{handle}/capture"), idempotency_key);
        self.execute_with_circuit_breaker("capture", builder).await
    }

    async fn release(&self, handle: &str, idempotency_key: &str) -> Result<GatewayObject, PaymentError> {
        info!("Releasing authorization {}", handle);
        let builder = self.post(&format!("/v1/authorizations/{handle}/release"), idempotency_key);
        self.execute_with_circuit_breaker("release", builder).await
    }

    async fn refund(
        &self,
        handle: &str,
        amount: Option<i64>,
        idempotency_key: &str,
    ) -> Result<GatewayObject, PaymentError> {
        info!("Refunding authorization {} (amount={:?})", handle, amount);
        let body = RefundBody { authorization_id: handle, amount };
        let builder = self.post("/v1/refunds", idempotency_key).json(&body);
        self.execute_with_circuit_breaker("refund", builder).await
    }
}
