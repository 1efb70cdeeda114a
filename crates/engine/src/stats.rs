//! Delivery statistics with a short-lived cache.
//!
//! A cached value is served only while it is younger than the TTL; after
//! that (or after [`StatsAggregator::invalidate`]) the next read aggregates
//! live from the store. A read that raced an invalidation is returned but
//! not cached.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use examhub_common::error::AppError;
use examhub_common::types::NotificationStats;

use crate::clock::{Clock, to_chrono};
use crate::store::{NotificationStore, StatusCounts};

pub struct StatsAggregator {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    cache: Mutex<Cache>,
}

#[derive(Default)]
struct Cache {
    /// Bumped on every invalidation.
    generation: u64,
    entry: Option<(DateTime<Utc>, NotificationStats)>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            ttl: to_chrono(ttl),
            cache: Mutex::new(Cache::default()),
        }
    }

    pub async fn get(&self) -> Result<NotificationStats, AppError> {
        let now = self.clock.now();

        let generation = {
            let cache = self.cache.lock().await;
            if let Some((computed_at, stats)) = cache.entry.as_ref()
                && now.signed_duration_since(*computed_at) < self.ttl
            {
                return Ok(stats.clone());
            }
            cache.generation
        };

        // The lock is not held across the store call
        let counts = self.store.aggregate(start_of_day(now)).await?;
        let stats = summarize(&counts);

        let mut cache = self.cache.lock().await;
        if cache.generation == generation {
            cache.entry = Some((now, stats.clone()));
        }

        Ok(stats)
    }

    /// Drop the cached value so the next read is live.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        cache.generation = cache.generation.wrapping_add(1);
        cache.entry = None;
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

fn summarize(counts: &StatusCounts) -> NotificationStats {
    let success_rate = if counts.total == 0 {
        0.0
    } else {
        (counts.sent as f64 / counts.total as f64 * 10_000.0).round() / 100.0
    };

    NotificationStats {
        total: counts.total,
        sent: counts.sent,
        pending: counts.pending + counts.processing + counts.retrying,
        failed: counts.failed,
        today: counts.today,
        success_rate,
    }
}
