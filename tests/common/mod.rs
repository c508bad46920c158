#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use deposit_guard::config::{AttendancePolicy, Config};
use deposit_guard::error::PaymentError;
use deposit_guard::middleware::{StaffAccount, StaffDirectory, StaffRole};
use deposit_guard::models::booking::{
    Booking, BookingPatch, BookingStatus, CaptureMethod, PaymentAuthorization, PaymentStatus,
};
use deposit_guard::models::space::{DepositPolicy, Space};
use deposit_guard::models::webhook::DeadLetter;
use deposit_guard::services::gateway::{self, AuthorizationRequest, GatewayObject, PaymentGateway};
use deposit_guard::services::ledger::IdempotencyLedger;
use deposit_guard::services::notifications::{NotificationKind, Notifier, NotifyError};
use deposit_guard::services::store::BookingStore;
use deposit_guard::services::webhook::WebhookOutcome;
use deposit_guard::AppState;

pub const SECRET: &str = "whsec_test";

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.payment.webhook_secret = SECRET.to_string();
    config.retry.base_backoff_ms = 0;
    config.retry.max_attempts = 3;
    config.attendance.default_policy = AttendancePolicy::NoShow;
    config.attendance.grace_period_mins = 30;
    config
}

// ---------- store ----------

#[derive(Default)]
pub struct InMemoryStore {
    spaces: Mutex<HashMap<Uuid, Space>>,
    bookings: Mutex<HashMap<Uuid, Booking>>,
    history: Mutex<HashMap<Uuid, Vec<PaymentStatus>>>,
    fail_next_insert: AtomicBool,
    fail_next_lookup: AtomicBool,
}

impl InMemoryStore {
    pub fn add_space(&self, policy: DepositPolicy) -> Uuid {
        let id = Uuid::new_v4();
        self.spaces.lock().unwrap().insert(
            id,
            Space {
                id,
                name: "Sala Norte".into(),
                deposit_policy: policy,
            },
        );
        id
    }

    pub fn put(&self, booking: Booking) {
        self.history
            .lock()
            .unwrap()
            .insert(booking.id, vec![booking.payment_status]);
        self.bookings.lock().unwrap().insert(booking.id, booking);
    }

    pub fn booking(&self, id: Uuid) -> Booking {
        self.bookings.lock().unwrap().get(&id).cloned().expect("booking exists")
    }

    pub fn count(&self) -> usize {
        self.bookings.lock().unwrap().len()
    }

    /// Все наблюдавшиеся значения paymentStatus по порядку.
    pub fn payment_history(&self, id: Uuid) -> Vec<PaymentStatus> {
        self.history.lock().unwrap().get(&id).cloned().unwrap_or_default()
    }

    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_lookup(&self) {
        self.fail_next_lookup.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BookingStore for InMemoryStore {
    async fn get_space(&self, id: Uuid) -> Result<Option<Space>, PaymentError> {
        Ok(self.spaces.lock().unwrap().get(&id).cloned())
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), PaymentError> {
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(PaymentError::Storage(sqlx::Error::Protocol("connection reset".into())));
        }
        self.put(booking.clone());
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, PaymentError> {
        Ok(self.bookings.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_authorization(&self, handle: &str) -> Result<Option<Booking>, PaymentError> {
        if self.fail_next_lookup.swap(false, Ordering::SeqCst) {
            return Err(PaymentError::Storage(sqlx::Error::PoolTimedOut));
        }
        Ok(self
            .bookings
            .lock()
            .unwrap()
            .values()
            .find(|b| b.authorization_handle() == Some(handle))
            .cloned())
    }

    async fn update_booking_conditional(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &BookingPatch,
    ) -> Result<bool, PaymentError> {
        let mut bookings = self.bookings.lock().unwrap();
        let Some(booking) = bookings.get_mut(&id) else {
            return Ok(false);
        };
        if booking.version != expected_version {
            return Ok(false);
        }
        let before = booking.payment_status;
        booking.apply(patch, Utc::now());
        booking.version += 1;
        if booking.payment_status != before {
            self.history
                .lock()
                .unwrap()
                .entry(id)
                .or_default()
                .push(booking.payment_status);
        }
        Ok(true)
    }

    async fn list_unresolved_holds(
        &self,
        on_or_before: NaiveDate,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Booking>, PaymentError> {
        let mut holds: Vec<Booking> = self
            .bookings
            .lock()
            .unwrap()
            .values()
            .filter(|b| {
                b.payment_status == PaymentStatus::Authorized
                    && b.capture_method() == Some(CaptureMethod::Manual)
                    && b.resolved_at.is_none()
                    && (b.pending_action.is_none() || b.updated_at < stale_before)
                    && b.status.is_open()
                    && b.date <= on_or_before
            })
            .cloned()
            .collect();
        holds.sort_by_key(|b| (b.date, b.end_time));
        Ok(holds)
    }

    async fn list_deferred_due(
        &self,
        on_or_before: NaiveDate,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Booking>, PaymentError> {
        Ok(self
            .bookings
            .lock()
            .unwrap()
            .values()
            .filter(|b| {
                b.payment_status == PaymentStatus::Authorized
                    && b.capture_method() == Some(CaptureMethod::Automatic)
                    && (b.pending_action.is_none() || b.updated_at < stale_before)
                    && b.status.is_open()
                    && b.date <= on_or_before
            })
            .cloned()
            .collect())
    }
}

// ---------- ledger ----------

#[derive(Default)]
pub struct InMemoryLedger {
    claims: Mutex<HashMap<String, Instant>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    fail_release: AtomicBool,
    fail_next_claim: AtomicBool,
}

impl InMemoryLedger {
    pub fn fail_release(&self) {
        self.fail_release.store(true, Ordering::SeqCst);
    }

    /// Следующий claim падает, ничего не записав (как атомарный скрипт в Redis).
    pub fn fail_next_claim(&self) {
        self.fail_next_claim.store(true, Ordering::SeqCst);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.claims.lock().unwrap().len()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn claim(&self, event_id: &str) -> Result<bool, PaymentError> {
        if self.fail_next_claim.swap(false, Ordering::SeqCst) {
            return Err(PaymentError::Ledger("redis is down".into()));
        }
        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(event_id) {
            return Ok(false);
        }
        claims.insert(event_id.to_string(), Instant::now());
        Ok(true)
    }

    async fn is_claimed(&self, event_id: &str) -> Result<bool, PaymentError> {
        Ok(self.claims.lock().unwrap().contains_key(event_id))
    }

    async fn release(&self, event_id: &str) -> Result<(), PaymentError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(PaymentError::Ledger("redis is down".into()));
        }
        self.claims.lock().unwrap().remove(event_id);
        Ok(())
    }

    async fn sweep(&self, older_than: Duration) -> Result<u64, PaymentError> {
        let mut claims = self.claims.lock().unwrap();
        let before = claims.len();
        claims.retain(|_, claimed_at| claimed_at.elapsed() < older_than);
        Ok((before - claims.len()) as u64)
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), PaymentError> {
        self.dead_letters.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

// ---------- gateway ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Decline,
    Unavailable,
}

impl Failure {
    fn into_error(self) -> PaymentError {
        match self {
            Failure::Decline => PaymentError::GatewayRejected {
                code: Some("card_declined".into()),
                reason: "Your card was declined".into(),
            },
            Failure::Unavailable => PaymentError::GatewayUnavailable("simulated timeout".into()),
        }
    }
}

#[derive(Default)]
struct Script {
    authorize: VecDeque<Failure>,
    capture: VecDeque<Failure>,
    release: VecDeque<Failure>,
    refund: VecDeque<Failure>,
}

/// Шлюз в памяти: считает вызовы, помнит ключи идемпотентности
/// и, как настоящий, отвечает `AlreadyCaptured` на повторное списание.
#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<Script>,
    handles_by_key: Mutex<HashMap<String, String>>,
    captured: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    pub authorize_requests: Mutex<Vec<AuthorizationRequest>>,
    pub authorize_calls: AtomicU32,
    pub capture_calls: AtomicU32,
    pub successful_captures: AtomicU32,
    pub release_calls: AtomicU32,
    pub refund_calls: AtomicU32,
    pub keys: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn fail_authorize(&self, failure: Failure, times: usize) {
        let mut script = self.script.lock().unwrap();
        script.authorize.extend(std::iter::repeat(failure).take(times));
    }

    pub fn fail_capture(&self, failure: Failure, times: usize) {
        let mut script = self.script.lock().unwrap();
        script.capture.extend(std::iter::repeat(failure).take(times));
    }

    pub fn fail_release(&self, failure: Failure, times: usize) {
        let mut script = self.script.lock().unwrap();
        script.release.extend(std::iter::repeat(failure).take(times));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn record_key(&self, key: &str) {
        self.keys.lock().unwrap().push(key.to_string());
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn verify_signature(
        &self,
        raw_body: &[u8],
        header: &str,
    ) -> Result<deposit_guard::models::webhook::GatewayEvent, PaymentError> {
        gateway::verify_signature(raw_body, header, SECRET, 300, Utc::now().timestamp())
    }

    async fn authorize(&self, request: &AuthorizationRequest) -> Result<String, PaymentError> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        self.authorize_requests.lock().unwrap().push(request.clone());
        self.record_key(&request.idempotency_key);
        self.pause().await;
        if let Some(failure) = self.script.lock().unwrap().authorize.pop_front() {
            return Err(failure.into_error());
        }
        let mut handles = self.handles_by_key.lock().unwrap();
        let next = format!("pi_{}", handles.len() + 1);
        Ok(handles.entry(request.idempotency_key.clone()).or_insert(next).clone())
    }

    async fn capture(&self, handle: &str, idempotency_key: &str) -> Result<GatewayObject, PaymentError> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        self.record_key(idempotency_key);
        self.pause().await;
        if let Some(failure) = self.script.lock().unwrap().capture.pop_front() {
            return Err(failure.into_error());
        }
        if !self.captured.lock().unwrap().insert(handle.to_string()) {
            return Err(PaymentError::AlreadyCaptured);
        }
        self.successful_captures.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayObject {
            id: handle.to_string(),
            status: Some("captured".into()),
            amount: None,
        })
    }

    async fn release(&self, handle: &str, idempotency_key: &str) -> Result<GatewayObject, PaymentError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.record_key(idempotency_key);
        self.pause().await;
        if let Some(failure) = self.script.lock().unwrap().release.pop_front() {
            return Err(failure.into_error());
        }
        Ok(GatewayObject {
            id: handle.to_string(),
            status: Some("canceled".into()),
            amount: None,
        })
    }

    async fn refund(
        &self,
        handle: &str,
        amount: Option<i64>,
        idempotency_key: &str,
    ) -> Result<GatewayObject, PaymentError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.record_key(idempotency_key);
        self.pause().await;
        if let Some(failure) = self.script.lock().unwrap().refund.pop_front() {
            return Err(failure.into_error());
        }
        Ok(GatewayObject {
            id: format!("re_{handle}"),
            status: Some("succeeded".into()),
            amount,
        })
    }
}

// ---------- notifier ----------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationKind, Uuid)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(NotificationKind, Uuid)> {
        self.sent.lock().unwrap().clone()
    }

    /// Уведомления уходят через tokio::spawn, даём им долететь.
    pub async fn settled(&self) -> Vec<(NotificationKind, Uuid)> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.sent()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((kind, booking.id));
        Ok(())
    }
}

// ---------- staff ----------

#[derive(Default)]
pub struct FakeStaff {
    accounts: Mutex<HashMap<String, StaffAccount>>,
}

impl FakeStaff {
    pub fn add(&self, email: &str, password: &str, role: StaffRole) {
        let account = StaffAccount {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: bcrypt::hash(password, 4).unwrap(),
            role,
        };
        self.accounts.lock().unwrap().insert(email.to_string(), account);
    }
}

#[async_trait]
impl StaffDirectory for FakeStaff {
    async fn find_active(&self, email: &str) -> Result<Option<StaffAccount>, PaymentError> {
        Ok(self.accounts.lock().unwrap().get(email).cloned())
    }
}

// ---------- harness ----------

pub struct Harness {
    pub config: Config,
    pub store: Arc<InMemoryStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub staff: Arc<FakeStaff>,
    pub state: Arc<AppState>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::default());
        let ledger = Arc::new(InMemoryLedger::default());
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let staff = Arc::new(FakeStaff::default());
        let state = AppState::from_parts(
            config.clone(),
            store.clone(),
            ledger.clone(),
            gateway.clone(),
            notifier.clone(),
            staff.clone(),
        );
        Self {
            config,
            store,
            ledger,
            gateway,
            notifier,
            staff,
            state,
        }
    }

    /// Кладёт в хранилище подтверждённую бронь с авторизованным депозитом 10.00.
    pub fn held_booking(&self, method: CaptureMethod, date: NaiveDate) -> Booking {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let booking = Booking {
            id,
            space_id: Uuid::new_v4(),
            date,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            party_size: 2,
            base_price: 4_000,
            additional_services_price: 1_000,
            total_price: 5_000,
            status: BookingStatus::Confirmed,
            payment_status: PaymentStatus::Authorized,
            requires_payment: true,
            authorization: Some(PaymentAuthorization {
                handle: Some(format!("pi_{}", id.simple())),
                amount: 1_000,
                currency: "EUR".into(),
                capture_method: method,
                captured_amount: None,
                authorized_at: Some(now),
                captured_at: None,
                released_at: None,
                refunded_at: None,
            }),
            pending_action: None,
            resolved_at: None,
            client: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.put(booking.clone());
        booking
    }

    pub async fn deliver(&self, body: &[u8]) -> Result<WebhookOutcome, PaymentError> {
        let header = sign(body);
        self.state.webhooks.handle(body, &header).await
    }
}

pub fn sign(body: &[u8]) -> String {
    gateway::signature_header(SECRET, Utc::now().timestamp(), body).unwrap()
}

pub fn event_body(event_id: &str, event_type: &str, handle: &str, amount: Option<i64>) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "authorization_id": handle, "amount": amount }
    }))
    .unwrap()
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Каждый переход в истории должен быть разрешён таблицей переходов.
pub fn assert_valid_path(history: &[PaymentStatus]) {
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition_to(&pair[1]),
            "illegal transition {} -> {} in {:?}",
            pair[0],
            pair[1],
            history
        );
    }
}
