use crate::model::{EventRow, PersistedEvent};
use crate::pipeline::EventSink;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// Keeps every statement well below SQLite's bound-parameter limit.
const INSERT_CHUNK_ROWS: usize = 1000;
const STATS_DEVICE_LIMIT: i64 = 200;

#[derive(sqlx::FromRow)]
struct EventRecord {
    id: i64,
    tenant_id: String,
    device_id: String,
    timestamp: i64,
    event_type: String,
    compute_type: String,
    details: String,
}

impl From<EventRecord> for PersistedEvent {
    fn from(row: EventRecord) -> Self {
        let details = serde_json::from_str(&row.details).unwrap_or_else(|err| {
            tracing::warn!(id = row.id, error = %err, "stored event details are not valid JSON");
            JsonValue::String(row.details)
        });
        PersistedEvent {
            id: row.id,
            tenant_id: row.tenant_id,
            device_id: row.device_id,
            timestamp: row.timestamp,
            event_type: row.event_type,
            compute_type: row.compute_type,
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    pub events: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub event_count: i64,
    pub devices: Vec<DeviceSummary>,
    pub recent_events: Vec<PersistedEvent>,
}

/// The events table. Only the batcher writes, only the sweeper deletes.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Writes the whole batch in one transaction; either every row lands or none do.
    pub async fn insert_batch(&self, batch: &[EventRow]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("failed to begin insert")?;
        for chunk in batch.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO events (tenant_id, device_id, timestamp, event_type, compute_type, details) ",
            );
            builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.tenant_id.as_str())
                    .push_bind(row.device_id.as_str())
                    .push_bind(row.timestamp)
                    .push_bind(row.event_type.as_str())
                    .push_bind(row.compute_type.as_str())
                    .push_bind(row.details.to_string());
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("failed to insert event batch")?;
        }
        tx.commit().await.context("failed to commit event batch")?;
        Ok(batch.len())
    }

    /// Events for a tenant newer than `since`, oldest first. `device_ids` restricts
    /// the result to any of the given stored identifiers.
    pub async fn events_since(
        &self,
        tenant_id: &str,
        device_ids: Option<&[String]>,
        since: i64,
        limit: i64,
    ) -> Result<Vec<PersistedEvent>> {
        let mut builder = select_events(tenant_id, device_ids);
        builder.push(" AND timestamp > ");
        builder.push_bind(since);
        builder.push(" ORDER BY timestamp ASC, id ASC LIMIT ");
        builder.push_bind(limit.max(1));
        self.fetch_events(builder).await
    }

    /// Every event stamped exactly `timestamp`, with no page cap.
    pub async fn events_at(
        &self,
        tenant_id: &str,
        device_ids: Option<&[String]>,
        timestamp: i64,
    ) -> Result<Vec<PersistedEvent>> {
        let mut builder = select_events(tenant_id, device_ids);
        builder.push(" AND timestamp = ");
        builder.push_bind(timestamp);
        builder.push(" ORDER BY id ASC");
        self.fetch_events(builder).await
    }

    async fn fetch_events(
        &self,
        mut builder: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<PersistedEvent>> {
        let rows: Vec<EventRecord> = builder
            .build_query_as::<EventRecord>()
            .fetch_all(&self.pool)
            .await
            .context("failed to query events")?;
        Ok(rows.into_iter().map(PersistedEvent::from).collect())
    }

    pub async fn delete_older_than(&self, threshold: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(threshold)
            .execute(&self.pool)
            .await
            .context("failed to delete expired events")?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self, recent: i64) -> Result<StoreStats> {
        let event_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await
            .context("failed to count events")?;
        let devices: Vec<DeviceSummary> = sqlx::query_as(
            r#"
            SELECT device_id, COUNT(*) AS events, MAX(timestamp) AS last_seen
            FROM events
            GROUP BY device_id
            ORDER BY last_seen DESC
            LIMIT ?
            "#,
        )
        .bind(STATS_DEVICE_LIMIT)
        .fetch_all(&self.pool)
        .await
        .context("failed to summarise devices")?;
        let recent_events: Vec<EventRecord> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, device_id, timestamp, event_type, compute_type, details
            FROM events
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(recent.max(0))
        .fetch_all(&self.pool)
        .await
        .context("failed to load recent events")?;

        Ok(StoreStats {
            event_count,
            devices,
            recent_events: recent_events.into_iter().map(PersistedEvent::from).collect(),
        })
    }
}

fn select_events<'a>(
    tenant_id: &'a str,
    device_ids: Option<&'a [String]>,
) -> QueryBuilder<'a, Sqlite> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, tenant_id, device_id, timestamp, event_type, compute_type, details \
         FROM events WHERE tenant_id = ",
    );
    builder.push_bind(tenant_id);
    if let Some(device_ids) = device_ids {
        builder.push(" AND device_id IN (");
        let mut separated = builder.separated(", ");
        for device_id in device_ids {
            separated.push_bind(device_id.as_str());
        }
        separated.push_unseparated(")");
    }
    builder
}

#[async_trait::async_trait]
impl EventSink for EventStore {
    async fn write_batch(&self, batch: &[EventRow]) -> Result<()> {
        self.insert_batch(batch).await.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) fn event_row(tenant: &str, device: &str, timestamp: i64) -> EventRow {
    use crate::model::SignalType;
    EventRow {
        tenant_id: tenant.to_string(),
        device_id: device.to_string(),
        timestamp,
        event_type: "IOT_TELEMETRY".to_string(),
        compute_type: "CT_TDOA".to_string(),
        signal_type: SignalType::Uwb,
        details: serde_json::json!({ "iotTelemetry": { "seq": timestamp }, "signalType": "UWB" }),
    }
}
