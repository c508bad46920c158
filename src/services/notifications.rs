use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::booking::{Booking, BookingStatus, PaymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Confirmed,
    Captured,
    Released,
    NoShow,
    Refunded,
    Cancelled,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Captured => "captured",
            Self::Released => "released",
            Self::NoShow => "no_show",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification dispatcher request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification dispatcher answered {0}")]
    Status(u16),
}

/// Внешний диспетчер уведомлений (письма клиенту и площадке).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError>;
}

/// Fire-and-forget: ошибка диспетчера только логируется и никогда не
/// влияет на ответ вызывающему.
pub fn dispatch(notifier: Arc<dyn Notifier>, kind: NotificationKind, booking: Booking) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(kind, &booking).await {
            warn!("Failed to send {} notification for booking {}: {}", kind.as_str(), booking.id, e);
        }
    });
}

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    event: &'static str,
    booking_id: Uuid,
    status: BookingStatus,
    payment_status: PaymentStatus,
    date: chrono::NaiveDate,
    client_email: Option<&'a str>,
    client_name: Option<&'a str>,
}

#[derive(Clone)]
pub struct HttpNotifier {
    url: String,
    http_client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(url: String) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self { url, http_client })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError> {
        let client = booking.client.as_ref();
        let payload = NotificationPayload {
            event: kind.as_str(),
            booking_id: booking.id,
            status: booking.status,
            payment_status: booking.payment_status,
            date: booking.date,
            client_email: client.and_then(|c| c.email.as_deref()),
            client_name: client.and_then(|c| c.name.as_deref()),
        };

        let response = self.http_client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Используется, когда диспетчер не настроен.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError> {
        info!(
            "Notification {} for booking {} (status={}, payment_status={})",
            kind.as_str(),
            booking.id,
            booking.status,
            booking.payment_status
        );
        Ok(())
    }
}
