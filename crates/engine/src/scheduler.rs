//! Periodic dispatch and reconciliation passes.
//!
//! Each pass runs in its own task. A pass is awaited inline by its loop, so
//! the same pass never overlaps itself; a slow pass simply delays the next
//! tick. A failing pass is logged and the cycle skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::NotificationEngine;

/// Drives [`NotificationEngine`] on fixed intervals.
pub struct Scheduler {
    engine: Arc<NotificationEngine>,
    dispatch_interval: Duration,
    reconcile_interval: Duration,
}

/// Running scheduler. Dropping it also ends the loops, without waiting for them.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<NotificationEngine>,
        dispatch_interval: Duration,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            engine,
            dispatch_interval,
            reconcile_interval,
        }
    }

    /// Scheduler using the engine's configured intervals.
    pub fn from_settings(engine: Arc<NotificationEngine>) -> Self {
        let settings = engine.settings();
        let (dispatch, reconcile) = (settings.dispatch_interval, settings.reconcile_interval);
        Self::new(engine, dispatch, reconcile)
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);

        tracing::info!(
            dispatch_interval_secs = self.dispatch_interval.as_secs(),
            reconcile_interval_secs = self.reconcile_interval.as_secs(),
            "Scheduler started"
        );

        let dispatch = {
            let engine = self.engine.clone();
            let mut rx = rx.clone();
            let period = self.dispatch_interval;
            tokio::spawn(async move {
                let mut ticker = ticker(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = rx.changed() => break,
                    }
                    if let Err(e) = engine.process_queue_now().await {
                        tracing::warn!(error = %e, "Dispatch pass failed, skipping cycle");
                    }
                }
                tracing::debug!("Dispatch loop stopped");
            })
        };

        let reconcile = {
            let engine = self.engine.clone();
            let mut rx = rx;
            let period = self.reconcile_interval;
            tokio::spawn(async move {
                let mut ticker = ticker(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = rx.changed() => break,
                    }
                    if let Err(e) = engine.retry_failed_now().await {
                        tracing::warn!(error = %e, "Reconciliation pass failed, skipping cycle");
                    }
                }
                tracing::debug!("Reconciliation loop stopped");
            })
        };

        SchedulerHandle {
            shutdown,
            tasks: vec![dispatch, reconcile],
        }
    }
}

impl SchedulerHandle {
    /// Signal both loops and wait for any in-flight pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Scheduler task panicked");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

/// First tick one full period after start, not immediately.
fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
