use crate::error::StreamError;
use crate::model::{now_millis, Tenant};
use crate::parser::{decode_line, passes_line_filter, LineSplitter};
use crate::pipeline::{spawn_worker, BatchSettings, EventSink, IngestStats, PipelineHandle};
use crate::registry::Registry;
use crate::telemetry::classify;
use crate::upstream::UpstreamConnector;
use anyhow::Result;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub reconcile_interval: Duration,
    pub restart_backoff: Duration,
    pub line_filter: String,
    pub max_line_buffer: usize,
    pub batch: BatchSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamPhase {
    Stopped,
    Starting,
    Streaming,
    Error,
}

/// Live view of one tenant's connection, reported by the debug endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantStreamState {
    pub tenant_id: String,
    pub phase: StreamPhase,
    pub last_error: Option<String>,
    pub restarts: u64,
    pub events_accepted: u64,
    pub connected_since: Option<i64>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

struct StreamUnit {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    credential: String,
    state: Arc<StdMutex<TenantStreamState>>,
}

impl StreamUnit {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "tenant stream task ended abnormally");
        }
    }
}

/// Owns one cancellable stream unit per active tenant.
pub struct StreamSupervisor {
    connector: Arc<dyn UpstreamConnector>,
    sink: Arc<dyn EventSink>,
    stats: Arc<IngestStats>,
    settings: SupervisorSettings,
    units: Mutex<HashMap<String, StreamUnit>>,
    /// Serialises reconciliations so a stopping tenant is never started twice.
    reconcile_lock: Mutex<()>,
    root_cancel: CancellationToken,
}

impl StreamSupervisor {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        sink: Arc<dyn EventSink>,
        settings: SupervisorSettings,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            connector,
            sink,
            stats,
            settings,
            units: Mutex::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Runs the reconciliation tick until `cancel` fires, then stops every unit.
    pub fn start(self: Arc<Self>, registry: Registry, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.reconcile(&registry).await {
                            tracing::warn!("tenant reconciliation failed: {err:#}");
                        }
                    }
                }
            }
            self.shutdown().await;
        })
    }

    pub async fn reconcile(&self, registry: &Registry) -> Result<ReconcileReport> {
        let desired = registry.list_active().await?;
        Ok(self.apply_desired(&desired).await)
    }

    /// Brings the running set in line with `desired`: starts missing tenants,
    /// restarts tenants whose credential changed or whose unit exited, and stops
    /// tenants that are no longer listed.
    pub async fn apply_desired(&self, desired: &[Tenant]) -> ReconcileReport {
        let wanted: HashMap<&str, &Tenant> =
            desired.iter().map(|tenant| (tenant.id.as_str(), tenant)).collect();
        let mut report = ReconcileReport::default();
        let _reconciling = self.reconcile_lock.lock().await;

        // Stopping waits for the unit's last batch, so it runs with the map unlocked.
        let mut stale = Vec::new();
        let mut units = self.units.lock().await;
        for (tenant_id, unit) in units.iter() {
            let reason = match wanted.get(tenant_id.as_str()) {
                None => Some("tenant no longer active"),
                Some(tenant) if tenant.api_key.trim() != unit.credential => {
                    Some("credential changed")
                }
                Some(_) if unit.task.is_finished() => Some("stream unit exited"),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                stale.push((tenant_id.clone(), reason));
            }
        }

        let stopping: Vec<(String, &str, StreamUnit)> = stale
            .into_iter()
            .filter_map(|(tenant_id, reason)| {
                units.remove(&tenant_id).map(|unit| (tenant_id, reason, unit))
            })
            .collect();
        drop(units);

        for (tenant_id, reason, unit) in stopping {
            tracing::info!(tenant = %tenant_id, reason, "stopping tenant stream");
            unit.stop().await;
            report.stopped.push(tenant_id);
        }

        let mut units = self.units.lock().await;
        for tenant in desired {
            if units.contains_key(&tenant.id) {
                continue;
            }
            tracing::info!(tenant = %tenant.id, name = %tenant.display_name, "starting tenant stream");
            units.insert(tenant.id.clone(), self.spawn_unit(tenant.clone()));
            report.started.push(tenant.id.clone());
        }

        report
    }

    fn spawn_unit(&self, tenant: Tenant) -> StreamUnit {
        let cancel = self.root_cancel.child_token();
        let state = Arc::new(StdMutex::new(TenantStreamState {
            tenant_id: tenant.id.clone(),
            phase: StreamPhase::Stopped,
            last_error: None,
            restarts: 0,
            events_accepted: 0,
            connected_since: None,
        }));
        let credential = tenant.api_key.trim().to_string();
        let stream = TenantStream {
            tenant,
            connector: self.connector.clone(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
            settings: self.settings.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
        };
        StreamUnit {
            cancel,
            task: tokio::spawn(stream.run()),
            credential,
            state,
        }
    }

    pub async fn snapshot(&self) -> Vec<TenantStreamState> {
        let units = self.units.lock().await;
        let mut states: Vec<TenantStreamState> = units
            .values()
            .filter_map(|unit| unit.state.lock().ok().map(|state| state.clone()))
            .collect();
        states.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        states
    }

    pub async fn tenant_state(&self, tenant_id: &str) -> Option<TenantStreamState> {
        let units = self.units.lock().await;
        let unit = units.get(tenant_id)?;
        unit.state.lock().ok().map(|state| state.clone())
    }

    /// Cancels every unit and waits for their pending batches to flush.
    pub async fn shutdown(&self) {
        self.root_cancel.cancel();
        let drained: Vec<StreamUnit> = self.units.lock().await.drain().map(|(_, unit)| unit).collect();
        for unit in drained {
            unit.stop().await;
        }
        tracing::info!("all tenant streams stopped");
    }
}

enum StreamEnd {
    Cancelled,
    UpstreamClosed,
}

/// One tenant's connect, stream, back off, reconnect loop.
struct TenantStream {
    tenant: Tenant,
    connector: Arc<dyn UpstreamConnector>,
    sink: Arc<dyn EventSink>,
    stats: Arc<IngestStats>,
    settings: SupervisorSettings,
    state: Arc<StdMutex<TenantStreamState>>,
    cancel: CancellationToken,
}

impl TenantStream {
    async fn run(self) {
        let mut reported_missing_credential = false;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.update(|state| {
                state.phase = StreamPhase::Starting;
                state.connected_since = None;
            });

            let reason = match self.stream_once().await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::UpstreamClosed) => {
                    tracing::info!(tenant = %self.tenant.id, "upstream closed the connection");
                    "upstream closed the connection".to_string()
                }
                Err(StreamError::MissingCredential) => {
                    if !reported_missing_credential {
                        tracing::warn!(tenant = %self.tenant.id, "tenant is active but has no API key; not connecting");
                        reported_missing_credential = true;
                    }
                    StreamError::MissingCredential.to_string()
                }
                Err(err) => {
                    tracing::warn!(tenant = %self.tenant.id, error = %err, "tenant stream terminated");
                    err.to_string()
                }
            };
            self.update(|state| {
                state.phase = StreamPhase::Error;
                state.last_error = Some(reason);
                state.connected_since = None;
                state.restarts += 1;
            });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.restart_backoff) => {}
            }
        }

        self.update(|state| {
            state.phase = StreamPhase::Stopped;
            state.connected_since = None;
        });
        tracing::debug!(tenant = %self.tenant.id, "tenant stream unit exited");
    }

    async fn stream_once(&self) -> Result<StreamEnd, StreamError> {
        let mut chunks = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            connected = self.connector.connect(&self.tenant) => connected?,
        };
        self.update(|state| {
            state.phase = StreamPhase::Streaming;
            state.connected_since = Some(now_millis());
        });
        tracing::info!(tenant = %self.tenant.id, "tenant stream connected");

        let (batcher, flusher) = spawn_worker(
            self.sink.clone(),
            self.stats.clone(),
            self.settings.batch,
            self.tenant.id.clone(),
        );
        let mut splitter = LineSplitter::new(self.settings.max_line_buffer);

        let outcome = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(StreamEnd::Cancelled),
                next = chunks.next() => next,
            };
            match next {
                None => break Ok(StreamEnd::UpstreamClosed),
                Some(Err(err)) => break Err(err),
                Some(Ok(chunk)) => match splitter.push(&chunk) {
                    Ok(lines) => {
                        for line in &lines {
                            self.handle_line(line, &batcher);
                        }
                    }
                    Err(err) => break Err(err),
                },
            }
        };

        drop(chunks);
        drop(batcher);
        if let Err(err) = flusher.await {
            tracing::warn!(tenant = %self.tenant.id, error = %err, "batch worker ended abnormally");
        }
        outcome
    }

    fn handle_line(&self, line: &[u8], batcher: &PipelineHandle) {
        if line.trim_ascii().is_empty() || !passes_line_filter(line, &self.settings.line_filter) {
            return;
        }
        let Some(record) = decode_line(line) else {
            self.stats.lines_malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match classify(&self.tenant.id, &record, now_millis()) {
            Some(row) => {
                self.stats.records_accepted.fetch_add(1, Ordering::Relaxed);
                if batcher.enqueue(row) {
                    self.update(|state| state.events_accepted += 1);
                }
            }
            None => {
                self.stats.records_ignored.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut TenantStreamState)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }
}
