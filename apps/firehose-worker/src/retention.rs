use crate::model::now_millis;
use crate::store::EventStore;
use anyhow::Result;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodically deletes events older than the retention horizon.
pub struct RetentionSweeper {
    store: EventStore,
    horizon: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: EventStore, horizon: Duration, interval: Duration) -> Self {
        Self {
            store,
            horizon,
            interval,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once(now_millis()).await {
                            tracing::warn!("retention sweep failed: {err:#}");
                        }
                    }
                }
            }
        })
    }

    /// Deletes every event with `timestamp < now_ms - horizon`.
    pub async fn sweep_once(&self, now_ms: i64) -> Result<u64> {
        let horizon_ms = i64::try_from(self.horizon.as_millis()).unwrap_or(i64::MAX);
        let threshold = now_ms.saturating_sub(horizon_ms);
        let deleted = self.store.delete_older_than(threshold).await?;
        if deleted > 0 {
            tracing::info!(deleted, threshold, "expired events removed");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::store::event_row;

    const HOUR_MS: i64 = 3_600_000;

    #[tokio::test]
    async fn sweep_removes_only_events_past_the_horizon() {
        let (_dir, pool) = test_pool().await;
        let store = EventStore::new(pool);
        let now = 100 * HOUR_MS;
        store
            .insert_batch(&[
                event_row("t1", "d", now - 48 * HOUR_MS),
                event_row("t1", "d", now - 24 * HOUR_MS - 1),
                event_row("t1", "d", now - 24 * HOUR_MS),
                event_row("t1", "d", now - HOUR_MS),
                event_row("t2", "d", now),
            ])
            .await
            .expect("insert");

        let sweeper = RetentionSweeper::new(
            store.clone(),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
        );
        assert_eq!(sweeper.sweep_once(now).await.expect("sweep"), 2);
        assert_eq!(sweeper.sweep_once(now).await.expect("second sweep"), 0);

        let mut remaining: Vec<i64> = Vec::new();
        for tenant in ["t1", "t2"] {
            remaining.extend(
                store
                    .events_since(tenant, None, 0, 100)
                    .await
                    .expect("query")
                    .iter()
                    .map(|event| event.timestamp),
            );
        }
        assert!(remaining.iter().all(|ts| *ts >= now - 24 * HOUR_MS));
        assert_eq!(remaining.len(), 3);
    }
}
