use crate::model::{now_millis, PersistedEvent};
use crate::pipeline::IngestStats;
use crate::store::EventStore;
use anyhow::Result;
use futures::Stream;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Every stored spelling a caller-supplied device identifier may match.
///
/// Identifiers are compared case-insensitively and without assuming a separator:
/// `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff` and `aabbccddeeff` all yield the same set.
pub fn device_id_candidates(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let lower = raw.to_ascii_lowercase();
    let hex: String = lower.chars().filter(char::is_ascii_hexdigit).collect();

    let mut candidates = vec![raw.to_string(), lower];
    if hex.len() == 12 {
        let pairs: Vec<&str> = (0..12).step_by(2).map(|i| &hex[i..i + 2]).collect();
        candidates.push(hex.clone());
        candidates.push(pairs.join(":"));
        candidates.push(pairs.join("-"));
    }

    let mut unique = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(&candidate) {
            unique.push(candidate);
        }
    }
    unique
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    pub events: Vec<PersistedEvent>,
    pub cursor: i64,
}

/// Events newer than `since`, oldest first, plus the cursor for the next call.
pub async fn query(
    store: &EventStore,
    tenant_id: &str,
    device_id: Option<&str>,
    since: i64,
    limit: i64,
) -> Result<QueryPage> {
    let candidates = device_id
        .map(device_id_candidates)
        .filter(|candidates| !candidates.is_empty());
    query_candidates(store, tenant_id, candidates.as_deref(), since, limit).await
}

async fn query_candidates(
    store: &EventStore,
    tenant_id: &str,
    device_ids: Option<&[String]>,
    since: i64,
    limit: i64,
) -> Result<QueryPage> {
    let limit = limit.max(1);
    let mut events = store.events_since(tenant_id, device_ids, since, limit).await?;

    // A full page may have cut a run of equal timestamps in half. Hold that run
    // back so `since = cursor` picks it up whole on the next call. When the run
    // fills the page there is nothing to hold back to, so return all of it.
    if events.len() as i64 >= limit {
        let first = events.first().map(|event| event.timestamp);
        let last = events.last().map(|event| event.timestamp);
        if let (Some(first), Some(last)) = (first, last) {
            if first != last {
                let keep = events.partition_point(|event| event.timestamp < last);
                events.truncate(keep);
            } else {
                events = store.events_at(tenant_id, device_ids, last).await?;
            }
        }
    }

    let cursor = events
        .last()
        .map(|event| event.timestamp)
        .unwrap_or(since)
        .max(since);
    Ok(QueryPage { events, cursor })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Connected { timestamp: i64 },
    Update {
        events: Vec<PersistedEvent>,
        cursor: i64,
    },
    Heartbeat { timestamp: i64 },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct SubscribeParams {
    pub tenant_id: String,
    pub device_id: Option<String>,
    pub since: i64,
    pub limit: i64,
    pub tick: Duration,
}

/// Counts a live push subscriber for as long as its stream exists.
struct SubscriberGuard {
    stats: Arc<IngestStats>,
}

impl SubscriberGuard {
    fn new(stats: Arc<IngestStats>) -> Self {
        stats.active_subscribers.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.stats.active_subscribers.fetch_sub(1, Ordering::Relaxed);
    }
}

struct PushState {
    store: EventStore,
    tenant_id: String,
    device_ids: Option<Vec<String>>,
    cursor: i64,
    limit: i64,
    tick: Duration,
    ticker: Option<Interval>,
    _guard: SubscriberGuard,
}

/// Push delivery: `connected` first, then one `update`, `heartbeat` or `error`
/// per tick. The ticker lives inside the stream, so dropping the stream on
/// client disconnect is what stops it.
pub fn subscribe(
    store: EventStore,
    stats: Arc<IngestStats>,
    params: SubscribeParams,
) -> impl Stream<Item = StreamMessage> + Send + 'static {
    let device_ids = params
        .device_id
        .as_deref()
        .map(device_id_candidates)
        .filter(|candidates| !candidates.is_empty());
    let state = PushState {
        store,
        tenant_id: params.tenant_id,
        device_ids,
        cursor: params.since,
        limit: params.limit,
        tick: params.tick,
        ticker: None,
        _guard: SubscriberGuard::new(stats),
    };

    futures::stream::unfold(state, |mut state| async move {
        let Some(ticker) = state.ticker.as_mut() else {
            let start = tokio::time::Instant::now() + state.tick;
            let mut ticker = tokio::time::interval_at(start, state.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            state.ticker = Some(ticker);
            return Some((
                StreamMessage::Connected {
                    timestamp: now_millis(),
                },
                state,
            ));
        };
        ticker.tick().await;

        let message = match query_candidates(
            &state.store,
            &state.tenant_id,
            state.device_ids.as_deref(),
            state.cursor,
            state.limit,
        )
        .await
        {
            Ok(page) if page.events.is_empty() => StreamMessage::Heartbeat {
                timestamp: now_millis(),
            },
            Ok(page) => {
                state.cursor = page.cursor;
                StreamMessage::Update {
                    events: page.events,
                    cursor: page.cursor,
                }
            }
            Err(err) => {
                tracing::warn!(tenant = %state.tenant_id, "push query failed: {err:#}");
                StreamMessage::Error {
                    message: "Internal DB Error".to_string(),
                }
            }
        };
        Some((message, state))
    })
}
