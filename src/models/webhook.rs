use serde::{Deserialize, Serialize};

/// Событие платёжного шлюза в том виде, в котором оно приходит в вебхуке.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix-время создания события на стороне шлюза.
    pub created: i64,
    pub data: GatewayEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEventData {
    /// Ссылка на авторизацию (payment intent / setup intent).
    pub authorization_id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventKind {
    AuthorizationSucceeded,
    AuthorizationFailed,
    CaptureSucceeded,
    CaptureFailed,
    ReleaseSucceeded,
    RefundSucceeded,
    Unknown(String),
}

impl GatewayEvent {
    pub fn kind(&self) -> GatewayEventKind {
        match self.event_type.as_str() {
            "authorization.succeeded" => GatewayEventKind::AuthorizationSucceeded,
            "authorization.failed" => GatewayEventKind::AuthorizationFailed,
            "capture.succeeded" => GatewayEventKind::CaptureSucceeded,
            "capture.failed" => GatewayEventKind::CaptureFailed,
            "release.succeeded" => GatewayEventKind::ReleaseSucceeded,
            "refund.succeeded" => GatewayEventKind::RefundSucceeded,
            other => GatewayEventKind::Unknown(other.to_string()),
        }
    }
}

/// Событие, которое не удалось ни применить, ни вернуть на повторную доставку.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub reason: String,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}
