use anyhow::{Context, Result};
use clap::Parser;
use firehose_worker::cli::Args;
use firehose_worker::config::Config;
use firehose_worker::db;
use firehose_worker::pipeline::IngestStats;
use firehose_worker::retention::RetentionSweeper;
use firehose_worker::routes;
use firehose_worker::state::AppState;
use firehose_worker::store::EventStore;
use firehose_worker::supervisor::StreamSupervisor;
use firehose_worker::upstream::HttpConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,firehose_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    match config
        .otlp_endpoint
        .as_deref()
        .map(normalize_otlp_http_endpoint)
        .filter(|endpoint| !endpoint.is_empty())
    {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "firehose-worker"),
                ])))
                .install_batch(Tokio)?;

            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otel_layer)
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = db::connect(&config.database_path, config.db_pool_size).await?;
    db::migrate(&pool).await?;

    let stats = Arc::new(IngestStats::new());
    let store = EventStore::new(pool.clone());
    let connector = HttpConnector::new(config.upstream_settings())?;
    let supervisor = Arc::new(StreamSupervisor::new(
        Arc::new(connector),
        Arc::new(store.clone()),
        config.supervisor_settings(),
        stats.clone(),
    ));
    let state = AppState::new(config.clone(), pool.clone(), supervisor.clone(), stats.clone());

    let cancel = CancellationToken::new();
    let supervisor_handle = if args.no_ingest {
        tracing::info!("ingest disabled; serving stored events only");
        None
    } else {
        Some(supervisor.start(state.registry.clone(), cancel.clone()))
    };
    let retention_handle = RetentionSweeper::new(
        store,
        config.retention_horizon(),
        config.cleanup_interval(),
    )
    .start(cancel.clone());

    let status_handle = {
        let stats = stats.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        tracing::info!(
                            written = snapshot.events_written,
                            dropped = snapshot.events_dropped,
                            malformed = snapshot.lines_malformed,
                            ignored = snapshot.records_ignored,
                            subscribers = snapshot.active_subscribers,
                            "ingest status"
                        );
                    }
                }
            }
        })
    };

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "firehose worker listening");

    let shutdown = cancel.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, routes::router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        res = &mut server_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                Ok(Err(err)) => tracing::error!(error = %err, "HTTP server failed"),
                Err(err) => tracing::error!(error = %err, "HTTP server task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    if let Some(handle) = supervisor_handle {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "supervisor task failed");
        }
    }
    let _ = retention_handle.await;
    let _ = status_handle.await;
    if !server_handle.is_finished()
        && tokio::time::timeout(HTTP_DRAIN_TIMEOUT, &mut server_handle)
            .await
            .is_err()
    {
        tracing::warn!("open HTTP connections did not drain; closing");
        server_handle.abort();
    }
    pool.close().await;

    Ok(())
}
