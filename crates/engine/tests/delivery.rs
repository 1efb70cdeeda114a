//! End-to-end delivery behaviour against the in-memory store and mock gateway.
//!
//! These need no external services and run with plain `cargo test`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use examhub_common::config::EngineSettings;
use examhub_common::types::{
    DeliveryEvent, DeliveryState, FailureClass, NewNotification, NotificationKind,
    NotificationRecord, NotificationStatus, Priority,
};
use examhub_engine::clock::{Clock, ManualClock};
use examhub_engine::engine::{DispatchMode, DispatchSummary, NotificationEngine, ReconcileSummary};
use examhub_engine::scheduler::Scheduler;
use examhub_engine::store::{MemoryNotificationStore, NotificationStore};
use examhub_notifier::mock::{MockGateway, MockOutcome};

// ============================================================
// Shared helpers
// ============================================================

const RETRY_DELAY: Duration = Duration::from_secs(60);

struct Harness {
    engine: Arc<NotificationEngine>,
    store: Arc<MemoryNotificationStore>,
    gateway: Arc<MockGateway>,
    clock: Arc<ManualClock>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn settings() -> EngineSettings {
    EngineSettings {
        retry_delay: RETRY_DELAY,
        ..Default::default()
    }
}

fn harness(gateway: MockGateway) -> Harness {
    harness_with(gateway, settings())
}

fn harness_with(gateway: MockGateway, settings: EngineSettings) -> Harness {
    let store = Arc::new(MemoryNotificationStore::new());
    let gateway = Arc::new(gateway);
    let clock = Arc::new(ManualClock::new(start()));
    let engine = Arc::new(NotificationEngine::with_clock(
        store.clone(),
        gateway.clone(),
        settings,
        clock.clone(),
    ));
    Harness {
        engine,
        store,
        gateway,
        clock,
    }
}

fn otp(recipient: &str, priority: Priority) -> NewNotification {
    NewNotification::new(
        recipient,
        NotificationKind::VerificationCode,
        json!({"code": "204518"}),
        priority,
    )
}

fn welcome(recipient: &str, priority: Priority) -> NewNotification {
    NewNotification::new(
        recipient,
        NotificationKind::Welcome,
        json!({"name": "Lea"}),
        priority,
    )
}

/// Check the record-level invariants that must hold at every step.
fn assert_invariants(records: &[NotificationRecord]) {
    for r in records {
        assert!(
            (0..=r.max_attempts).contains(&r.attempt_count),
            "attempt count out of range: {:?}",
            r
        );
        if r.status == NotificationStatus::Sent {
            assert!(r.sent_at.is_some(), "sent without sent_at: {:?}", r);
            assert!(r.provider_message_id.is_some(), "sent without provider id: {:?}", r);
        }
        if r.status == NotificationStatus::Failed {
            assert!(r.last_attempt_at.is_some(), "failed without attempt time: {:?}", r);
            assert!(r.failure_class.is_some(), "failed without class: {:?}", r);
        }
        assert_eq!(r.attempt_count == 0, r.last_attempt_at.is_none());
    }
}

// ============================================================
// Urgent inline dispatch
// ============================================================

#[tokio::test]
async fn test_urgent_submit_is_sent_before_returning() {
    let h = harness(MockGateway::new());

    let id = h
        .engine
        .submit(otp("urgent@example.com", Priority::Urgent))
        .await
        .unwrap();

    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Sent);
    assert_eq!(record.provider_message_id.as_deref(), Some("mock-1"));
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.sent_at, Some(start()));
    assert_eq!(h.gateway.call_count(), 1);

    // Nothing left for the scheduled pass
    let summary = h.engine.process_queue_now().await.unwrap();
    assert_eq!(summary, DispatchSummary::default());
    assert_eq!(h.gateway.call_count(), 1);
}

#[tokio::test]
async fn test_urgent_inline_failure_still_returns_id() {
    let h = harness(MockGateway::failing_transient("provider 503"));

    let id = h
        .engine
        .submit(otp("flaky@example.com", Priority::Urgent))
        .await
        .unwrap();

    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.failure_class, Some(FailureClass::Transient));
    assert_eq!(record.delivery_state(), DeliveryState::AwaitingRetry);
}

#[tokio::test]
async fn test_explicit_inline_mode_for_high_priority() {
    let h = harness(MockGateway::new());

    let id = h
        .engine
        .submit_with(otp("otp@example.com", Priority::High), DispatchMode::Inline)
        .await
        .unwrap();

    assert_eq!(
        h.engine.get_status(id).await.unwrap().status,
        NotificationStatus::Sent
    );
}

// ============================================================
// Retry and backoff
// ============================================================

#[tokio::test]
async fn test_transient_failures_exhaust_after_max_attempts() {
    let h = harness(MockGateway::failing_transient("provider 503"));

    let id = h
        .engine
        .submit(welcome("down@example.com", Priority::Normal))
        .await
        .unwrap();

    for cycle in 1..=3 {
        let dispatched = h.engine.process_queue_now().await.unwrap();
        assert_eq!(dispatched.claimed, 1, "cycle {}", cycle);

        let record = h.engine.get_status(id).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Failed);
        assert_eq!(record.attempt_count, cycle);
        assert_invariants(&h.store.all().await);

        h.clock.advance(RETRY_DELAY);
        h.engine.retry_failed_now().await.unwrap();
    }

    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.delivery_state(), DeliveryState::Exhausted);
    assert_eq!(h.gateway.call_count(), 3);

    // Exhausted records are never requeued
    h.clock.advance(RETRY_DELAY * 10);
    assert_eq!(
        h.engine.retry_failed_now().await.unwrap(),
        ReconcileSummary::default()
    );

    let stats = h.engine.get_stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success_rate, 0.0);
}

#[tokio::test]
async fn test_backoff_is_respected() {
    let h = harness(MockGateway::scripted([MockOutcome::Transient(
        "timeout".into(),
    )]));

    let id = h
        .engine
        .submit(welcome("wait@example.com", Priority::Normal))
        .await
        .unwrap();
    h.engine.process_queue_now().await.unwrap();

    h.clock.advance(RETRY_DELAY - Duration::from_secs(1));
    assert_eq!(h.engine.retry_failed_now().await.unwrap().promoted, 0);
    assert_eq!(h.engine.process_queue_now().await.unwrap().claimed, 0);

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.engine.retry_failed_now().await.unwrap().promoted, 1);
    assert_eq!(
        h.engine.get_status(id).await.unwrap().status,
        NotificationStatus::Retrying
    );

    let summary = h.engine.process_queue_now().await.unwrap();
    assert_eq!(summary.sent, 1);

    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Sent);
    assert_eq!(record.attempt_count, 2);
    assert!(record.failure_reason.is_none());
    assert_invariants(&h.store.all().await);
}

#[tokio::test]
async fn test_permanent_failure_is_terminal() {
    let h = harness(MockGateway::failing_permanent("mailbox does not exist"));
    let mut events = h.engine.subscribe();

    let id = h
        .engine
        .submit(otp("nobody@example.com", Priority::Urgent))
        .await
        .unwrap();

    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.delivery_state(), DeliveryState::Rejected);

    h.clock.advance(RETRY_DELAY * 10);
    assert_eq!(h.engine.retry_failed_now().await.unwrap().promoted, 0);
    assert_eq!(h.gateway.call_count(), 1);

    let event = events.recv().await.unwrap();
    assert_eq!(event.event, DeliveryEvent::FAILED);
    assert_eq!(event.notification_id, id);
    assert!(
        event
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("mailbox does not exist")
    );
}

#[tokio::test(start_paused = true)]
async fn test_gateway_timeout_is_transient() {
    let settings = EngineSettings {
        send_timeout: Duration::from_secs(5),
        ..settings()
    };
    let h = harness_with(
        MockGateway::scripted([MockOutcome::Hang]),
        settings,
    );

    let id = h
        .engine
        .submit(otp("slow@example.com", Priority::Urgent))
        .await
        .unwrap();

    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Failed);
    assert_eq!(record.failure_class, Some(FailureClass::Transient));
    assert!(record.failure_reason.unwrap().contains("timed out"));
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn test_abandoned_claim_is_recovered_and_retried() {
    let h = harness(MockGateway::new());

    let id = h
        .engine
        .submit(welcome("crash@example.com", Priority::Normal))
        .await
        .unwrap();

    // A dispatcher claims the record and dies before recording an outcome
    h.store.try_claim(id, h.clock.now()).await.unwrap();
    assert_eq!(h.engine.process_queue_now().await.unwrap().claimed, 0);

    h.clock.advance(settings().stale_claim_after + Duration::from_secs(1));
    let summary = h.engine.retry_failed_now().await.unwrap();
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.promoted, 1);

    assert_eq!(h.engine.process_queue_now().await.unwrap().sent, 1);
    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Sent);
    assert_eq!(record.attempt_count, 2);
    assert_invariants(&h.store.all().await);
}

#[tokio::test]
async fn test_claim_within_send_timeout_is_not_recovered() {
    // Stale window shorter than the send timeout
    let settings = EngineSettings {
        send_timeout: Duration::from_secs(900),
        stale_claim_after: Duration::from_secs(600),
        ..settings()
    };
    let h = harness_with(MockGateway::new(), settings);

    let id = h
        .engine
        .submit(welcome("slow@example.com", Priority::Normal))
        .await
        .unwrap();
    // The owner is still waiting on the provider
    h.store.try_claim(id, h.clock.now()).await.unwrap();

    h.clock.advance(Duration::from_secs(700));
    let summary = h.engine.retry_failed_now().await.unwrap();
    assert_eq!(summary.recovered, 0);
    assert_eq!(h.engine.process_queue_now().await.unwrap().claimed, 0);
    assert_eq!(h.gateway.call_count(), 0);

    h.clock.advance(Duration::from_secs(202));
    assert_eq!(h.engine.retry_failed_now().await.unwrap().recovered, 1);
    assert_invariants(&h.store.all().await);
}

#[tokio::test]
async fn test_reconciliation_with_huge_windows_does_not_panic() {
    let settings = EngineSettings {
        retry_delay: Duration::MAX,
        stale_claim_after: Duration::MAX,
        ..settings()
    };
    let h = harness_with(
        MockGateway::scripted([MockOutcome::Transient("provider 503".into())]),
        settings,
    );

    h.engine
        .submit(welcome("far@example.com", Priority::Normal))
        .await
        .unwrap();
    assert_eq!(h.engine.process_queue_now().await.unwrap().retry_scheduled, 1);

    let summary = h.engine.retry_failed_now().await.unwrap();
    assert_eq!(summary.recovered, 0);
    assert_eq!(summary.promoted, 0);
}

// ============================================================
// Ordering and concurrency
// ============================================================

#[tokio::test]
async fn test_batches_drain_by_priority_then_fifo() {
    let h = harness(MockGateway::new());

    let submissions = [
        ("low@example.com", Priority::Low),
        ("normal-1@example.com", Priority::Normal),
        ("urgent@example.com", Priority::Urgent),
        ("high@example.com", Priority::High),
        ("normal-2@example.com", Priority::Normal),
    ];
    for (recipient, priority) in submissions {
        h.engine
            .submit_with(welcome(recipient, priority), DispatchMode::Queued)
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(1));
    }

    let mut claimed = Vec::new();
    loop {
        let summary = h.engine.dispatch_batch(2).await.unwrap();
        if summary.claimed == 0 {
            break;
        }
        assert!(summary.claimed <= 2);
        claimed.push(summary.claimed);
    }
    assert_eq!(claimed, vec![2, 2, 1]);

    let order: Vec<String> = h
        .gateway
        .attempts()
        .await
        .into_iter()
        .map(|email| email.to)
        .collect();
    assert_eq!(
        order,
        vec![
            "urgent@example.com",
            "high@example.com",
            "normal-1@example.com",
            "normal-2@example.com",
            "low@example.com",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatchers_never_double_send() {
    let store = Arc::new(MemoryNotificationStore::new());
    let gateway = Arc::new(MockGateway::new().with_delay(Duration::from_millis(20)));
    let clock = Arc::new(ManualClock::new(start()));

    // The worker's scheduled pass and a manual trigger through the API
    let scheduled = Arc::new(NotificationEngine::with_clock(
        store.clone(),
        gateway.clone(),
        settings(),
        clock.clone(),
    ));
    let manual = Arc::new(NotificationEngine::with_clock(
        store.clone(),
        gateway.clone(),
        settings(),
        clock.clone(),
    ));

    for i in 0..20 {
        scheduled
            .submit(welcome(&format!("user-{}@example.com", i), Priority::Normal))
            .await
            .unwrap();
    }

    let (a, b, c) = tokio::join!(
        scheduled.dispatch_batch(15),
        manual.dispatch_batch(15),
        manual.dispatch_batch(15),
    );
    let total = a.unwrap().claimed + b.unwrap().claimed + c.unwrap().claimed;

    assert_eq!(total, 20);
    assert_eq!(gateway.call_count(), 20);
    for i in 0..20 {
        assert_eq!(
            gateway.attempts_to(&format!("user-{}@example.com", i)).await,
            1
        );
    }
    let records = store.all().await;
    assert!(records.iter().all(|r| r.status == NotificationStatus::Sent));
    assert_invariants(&records);
}

#[tokio::test]
async fn test_passes_are_idempotent_when_nothing_changed() {
    let h = harness(MockGateway::new());
    h.engine
        .submit(welcome("once@example.com", Priority::Normal))
        .await
        .unwrap();

    assert_eq!(h.engine.process_queue_now().await.unwrap().sent, 1);
    let after_first = h.store.all().await;

    assert_eq!(
        h.engine.process_queue_now().await.unwrap(),
        DispatchSummary::default()
    );
    assert_eq!(
        h.engine.retry_failed_now().await.unwrap(),
        ReconcileSummary::default()
    );
    assert_eq!(h.store.all().await, after_first);
    assert_eq!(h.gateway.call_count(), 1);
}

// ============================================================
// Admin queries
// ============================================================

#[tokio::test]
async fn test_history_returns_most_recent_first() {
    let h = harness(MockGateway::new());

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            h.engine
                .submit(otp("repeat@example.com", Priority::Urgent))
                .await
                .unwrap(),
        );
        h.clock.advance(Duration::from_secs(30));
    }
    h.engine
        .submit(otp("someone-else@example.com", Priority::Urgent))
        .await
        .unwrap();

    let history = h.engine.get_history("repeat@example.com", 2).await.unwrap();
    assert_eq!(
        history.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![ids[4], ids[3]]
    );

    assert_eq!(
        h.engine
            .get_history("repeat@example.com", 50)
            .await
            .unwrap()
            .len(),
        5
    );
    assert!(
        h.engine
            .get_history("unknown@example.com", 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_stats_reflect_outcomes() {
    let h = harness(MockGateway::scripted([
        MockOutcome::Deliver,
        MockOutcome::Deliver,
        MockOutcome::Permanent("rejected".into()),
    ]));

    for i in 0..3 {
        h.engine
            .submit(welcome(&format!("s{}@example.com", i), Priority::Normal))
            .await
            .unwrap();
    }
    // Cached before dispatch; outcomes must invalidate it
    assert_eq!(h.engine.get_stats().await.unwrap().pending, 3);

    h.engine.process_queue_now().await.unwrap();
    h.engine
        .submit(welcome("later@example.com", Priority::Low))
        .await
        .unwrap();

    let stats = h.engine.get_stats().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.today, 4);
    assert_eq!(stats.success_rate, 50.0);
}

// ============================================================
// Store outages
// ============================================================

#[tokio::test]
async fn test_unavailable_store_fails_loudly_and_recovers() {
    let h = harness(MockGateway::new());
    let id = h
        .engine
        .submit(welcome("queued@example.com", Priority::Normal))
        .await
        .unwrap();

    h.store.set_available(false);

    let err = h
        .engine
        .submit(welcome("lost@example.com", Priority::Normal))
        .await
        .unwrap_err();
    assert!(err.is_store_unavailable());
    assert!(h.engine.process_queue_now().await.unwrap_err().is_store_unavailable());
    assert!(h.engine.retry_failed_now().await.unwrap_err().is_store_unavailable());
    assert!(h.engine.get_status(id).await.unwrap_err().is_store_unavailable());
    assert_eq!(h.gateway.call_count(), 0);

    h.store.set_available(true);
    assert_eq!(h.engine.process_queue_now().await.unwrap().sent, 1);
    assert_eq!(h.store.all().await.len(), 1);
}

// ============================================================
// Scheduler
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_scheduler_dispatches_and_retries_on_its_own() {
    let settings = EngineSettings {
        dispatch_interval: Duration::from_secs(30),
        reconcile_interval: Duration::from_secs(60),
        ..settings()
    };
    let h = harness_with(
        MockGateway::scripted([MockOutcome::Transient("provider 503".into())]),
        settings,
    );

    let id = h
        .engine
        .submit(welcome("tick@example.com", Priority::Normal))
        .await
        .unwrap();

    let handle = Scheduler::from_settings(h.engine.clone()).start();

    // No tick yet
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.gateway.call_count(), 0);

    // First dispatch tick at 30s fails transiently
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.gateway.call_count(), 1);
    assert_eq!(
        h.engine.get_status(id).await.unwrap().status,
        NotificationStatus::Failed
    );

    // Backoff elapses on the engine clock; reconcile at 60s, dispatch by 90s
    h.clock.advance(RETRY_DELAY * 2);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let record = h.engine.get_status(id).await.unwrap();
    assert_eq!(record.status, NotificationStatus::Sent);
    assert_eq!(record.attempt_count, 2);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_survives_failing_pass() {
    let settings = EngineSettings {
        dispatch_interval: Duration::from_secs(10),
        ..settings()
    };
    let h = harness_with(MockGateway::new(), settings);
    h.engine
        .submit(welcome("outage@example.com", Priority::Normal))
        .await
        .unwrap();

    let handle = Scheduler::from_settings(h.engine.clone()).start();

    h.store.set_available(false);
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(h.gateway.call_count(), 0);

    h.store.set_available(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.gateway.call_count(), 1);

    handle.stop().await;
}
