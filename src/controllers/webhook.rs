use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::services::gateway::SIGNATURE_HEADER;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/payments/webhook", post(receive_webhook))
}

/// POST /payments/webhook
///
/// Тело принимается как есть: подпись считается по сырым байтам.
/// 200 - событие подтверждено (в том числе дубликат и неизвестная бронь),
/// 400 - подпись не прошла, 5xx - просим шлюз доставить событие ещё раз.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let outcome = state.webhooks.handle(&body, signature).await?;

    Ok((StatusCode::OK, Json(json!({ "received": true, "outcome": outcome.as_str() }))))
}
