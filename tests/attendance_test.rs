mod common;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use common::{assert_valid_path, event_body, test_config, Failure, FakeGateway, Harness};
use deposit_guard::config::AttendancePolicy;
use deposit_guard::models::booking::{BookingStatus, CaptureMethod, PaymentStatus, PendingAction};
use deposit_guard::services::notifications::NotificationKind;
use deposit_guard::services::webhook::WebhookOutcome;
use std::time::Duration;

fn event_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
}

// Бронь в фикстуре заканчивается в 11:00, grace period 30 минут
fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).unwrap()
}

#[tokio::test]
async fn unattended_hold_is_captured_after_grace_period() {
    let h = Harness::new();
    let booking = h.held_booking(CaptureMethod::Manual, event_day());

    let report = h.state.attendance().sweep_at(at(12, 0)).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.settled, 1);

    let stored = h.store.booking(booking.id);
    assert_eq!(stored.status, BookingStatus::NoShow);
    assert_eq!(stored.payment_status, PaymentStatus::Captured);
    assert!(stored.resolved_at.is_some());

    // Шлюз потом присылает своё подтверждение списания
    let handle = booking.authorization_handle().unwrap().to_string();
    let body = event_body("evt_noshow", "capture.succeeded", &handle, Some(1_000));
    assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::AlreadyApplied);
    assert_eq!(h.deliver(&body).await.unwrap(), WebhookOutcome::Duplicate);

    assert_eq!(FakeGateway::calls(&h.gateway.successful_captures), 1);
    assert_eq!(
        h.store.payment_history(booking.id),
        vec![PaymentStatus::Authorized, PaymentStatus::Captured]
    );
    assert_eq!(h.notifier.settled().await, vec![(NotificationKind::NoShow, booking.id)]);
}

#[tokio::test]
async fn holds_within_grace_period_are_untouched() {
    let h = Harness::new();
    h.held_booking(CaptureMethod::Manual, event_day());

    let report = h.state.attendance().sweep_at(at(11, 20)).await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(FakeGateway::calls(&h.gateway.capture_calls), 0);
}

#[tokio::test]
async fn manually_resolved_booking_is_not_swept() {
    let h = Harness::new();
    let booking = h.held_booking(CaptureMethod::Manual, event_day());
    h.state.resolutions.mark_present(booking.id).await.unwrap();

    let report = h.state.attendance().sweep_at(at(13, 0)).await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(FakeGateway::calls(&h.gateway.capture_calls), 0);
    assert_eq!(h.store.booking(booking.id).payment_status, PaymentStatus::Released);
}

#[tokio::test]
async fn leave_pending_policy_only_reports() {
    let mut config = test_config();
    config.attendance.default_policy = AttendancePolicy::LeavePending;
    let h = Harness::with_config(config);
    let booking = h.held_booking(CaptureMethod::Manual, event_day());

    let report = h.state.attendance().sweep_at(at(12, 0)).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.left_pending, 1);
    assert_eq!(report.settled, 0);

    let stored = h.store.booking(booking.id);
    assert_eq!(stored.payment_status, PaymentStatus::Authorized);
    assert_eq!(stored.resolved_at, None);
    assert!(h.gateway.keys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn deferred_authorizations_are_not_attendance_holds() {
    let h = Harness::new();
    h.held_booking(CaptureMethod::Automatic, event_day());

    let report = h.state.attendance().sweep_at(at(12, 0)).await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn sweep_racing_admin_touches_gateway_once() {
    let h = Harness::new();
    h.gateway.set_delay(Duration::from_millis(20));
    let booking = h.held_booking(CaptureMethod::Manual, event_day());
    let attendance = h.state.attendance();

    let (admin, sweep) = tokio::join!(
        h.state.resolutions.mark_present(booking.id),
        attendance.sweep_at(at(12, 0))
    );
    sweep.unwrap();

    let calls = FakeGateway::calls(&h.gateway.release_calls) + FakeGateway::calls(&h.gateway.capture_calls);
    assert_eq!(calls, 1);

    let stored = h.store.booking(booking.id);
    assert!(stored.resolved_at.is_some());
    assert_eq!(stored.pending_action, None);
    if admin.is_ok() {
        assert_eq!(stored.payment_status, PaymentStatus::Released);
    } else {
        assert_eq!(stored.payment_status, PaymentStatus::Captured);
    }
    assert_valid_path(&h.store.payment_history(booking.id));
}

#[tokio::test]
async fn gateway_outage_is_retried_on_next_sweep() {
    let h = Harness::new();
    let booking = h.held_booking(CaptureMethod::Manual, event_day());
    h.gateway.fail_capture(Failure::Unavailable, 3);

    let report = h.state.attendance().sweep_at(at(12, 0)).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.booking(booking.id).payment_status, PaymentStatus::Authorized);

    let report = h.state.attendance().sweep_at(at(12, 5)).await.unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(h.store.booking(booking.id).payment_status, PaymentStatus::Captured);
}

#[tokio::test]
async fn abandoned_claim_is_picked_up_by_the_sweep() {
    let h = Harness::new();
    let mut booking = h.held_booking(CaptureMethod::Manual, event_day());
    booking.pending_action = Some(PendingAction::Capture);
    booking.updated_at = at(10, 0);
    h.store.put(booking.clone());

    let report = h.state.attendance().sweep_at(at(12, 0)).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.settled, 1);

    let stored = h.store.booking(booking.id);
    assert_eq!(stored.status, BookingStatus::NoShow);
    assert_eq!(stored.payment_status, PaymentStatus::Captured);
    assert_eq!(stored.pending_action, None);
    assert_eq!(h.gateway.keys.lock().unwrap().clone(), vec![format!("{}:capture", booking.id)]);
}

#[tokio::test]
async fn recent_claim_is_left_to_its_owner() {
    let h = Harness::new();
    let mut booking = h.held_booking(CaptureMethod::Manual, event_day());
    booking.pending_action = Some(PendingAction::Release);
    booking.updated_at = at(11, 55);
    h.store.put(booking.clone());

    let report = h.state.attendance().sweep_at(at(12, 0)).await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(FakeGateway::calls(&h.gateway.capture_calls), 0);
    assert_eq!(h.store.booking(booking.id).pending_action, Some(PendingAction::Release));
}

#[tokio::test]
async fn abandoned_pre_charge_claim_is_retried() {
    let h = Harness::new();
    let mut booking = h.held_booking(CaptureMethod::Automatic, NaiveDate::from_ymd_opt(2026, 3, 16).unwrap());
    booking.pending_action = Some(PendingAction::Capture);
    booking.updated_at = at(6, 0);
    h.store.put(booking.clone());

    let report = h.state.pre_charge().run_at(at(8, 0)).await.unwrap();
    assert_eq!(report.settled, 1);

    let stored = h.store.booking(booking.id);
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    assert_eq!(stored.pending_action, None);
}

#[tokio::test]
async fn deferred_deposit_is_charged_before_the_booking() {
    let h = Harness::new();
    let due = h.held_booking(CaptureMethod::Automatic, NaiveDate::from_ymd_opt(2026, 3, 16).unwrap());
    let later = h.held_booking(CaptureMethod::Automatic, NaiveDate::from_ymd_opt(2026, 3, 25).unwrap());
    let manual = h.held_booking(CaptureMethod::Manual, NaiveDate::from_ymd_opt(2026, 3, 16).unwrap());

    let report = h.state.pre_charge().run_at(at(8, 0)).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.settled, 1);

    let charged = h.store.booking(due.id);
    assert_eq!(charged.payment_status, PaymentStatus::Paid);
    assert_eq!(charged.status, BookingStatus::Confirmed);
    assert_eq!(charged.resolved_at, None);
    assert_eq!(h.store.booking(later.id).payment_status, PaymentStatus::Authorized);
    assert_eq!(h.store.booking(manual.id).payment_status, PaymentStatus::Authorized);
    assert_eq!(h.gateway.keys.lock().unwrap().clone(), vec![format!("{}:capture", due.id)]);

    let again = h.state.pre_charge().run_at(at(9, 0)).await.unwrap();
    assert_eq!(again.examined, 0);
    assert_eq!(h.notifier.settled().await, vec![(NotificationKind::Captured, due.id)]);
}
