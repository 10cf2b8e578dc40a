use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use firehose_worker::db;
use firehose_worker::distribution::query;
use firehose_worker::pipeline::{BatchSettings, IngestStats};
use firehose_worker::registry::{Registration, Registry};
use firehose_worker::store::EventStore;
use firehose_worker::supervisor::{StreamPhase, StreamSupervisor, SupervisorSettings};
use firehose_worker::upstream::{HttpConnector, UpstreamSettings};
use futures::{stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const RANGING_RECORD: &str = r#"{"eventType":"IOT_TELEMETRY","recordTimestamp":1700000000000,"iotTelemetry":{"deviceInfo":{"deviceId":"10:35:97:15:B3:33","deviceName":"tag-1"},"detectedPosition":{"computeType":"CT_RSSI","xPos":227.6,"yPos":216.2},"allComputedPositions":[{"computeType":"CT_TDOA","xPos":241.9,"yPos":250.9},{"computeType":"CT_RSSI","xPos":227.6,"yPos":216.2}]}}"#;
const PLACEHOLDER_RECORD: &str = r#"{"eventType":"IOT_TELEMETRY","recordTimestamp":1700000001000,"iotTelemetry":{"deviceInfo":{"deviceId":"10:35:97:15:B3:33"},"detectedPosition":{"computeType":"CT_TDOA","xPos":0,"yPos":0}}}"#;
const OTHER_EVENT: &str = r#"{"eventType":"DEVICE_ENTRY","deviceEntry":{"device":{"macAddress":"aa:bb"}}}"#;

async fn firehose(headers: HeaderMap) -> Response {
    let key = headers.get("x-api-key").and_then(|value| value.to_str().ok());
    if key != Some("good-key") {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (head, tail) = RANGING_RECORD.split_at(57);
    let chunks = vec![
        Bytes::from_static(b"\n"),
        Bytes::copy_from_slice(head.as_bytes()),
        Bytes::from(format!("{tail}\n{OTHER_EVENT}\nnot json at all IOT_TELEMETRY\n")),
        Bytes::from(format!("data: {PLACEHOLDER_RECORD}\r\n")),
    ];
    let body = stream::iter(chunks.into_iter().map(Ok::<Bytes, Infallible>)).chain(stream::pending());
    Response::new(Body::from_stream(body))
}

#[tokio::test]
async fn upstream_records_flow_into_the_queryable_store() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/events", get(firehose))).await
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let pool = db::connect(&dir.path().join("firehose.db"), 4)
        .await
        .expect("connect");
    db::migrate(&pool).await.expect("migrate");
    let registry = Registry::new(pool.clone());
    let store = EventStore::new(pool.clone());

    for (tenant, key) in [("good", "good-key"), ("bad", "wrong-key")] {
        registry
            .register(&Registration {
                tenant_id: tenant.to_string(),
                display_name: Some(format!("{tenant} tenant")),
                api_key: Some(key.to_string()),
                active: None,
            })
            .await
            .expect("register");
    }

    let connector = HttpConnector::new(UpstreamSettings {
        url: format!("http://{addr}/events"),
        api_key_header: "X-API-Key".to_string(),
        connect_timeout: Duration::from_secs(2),
    })
    .expect("connector");
    let stats = Arc::new(IngestStats::new());
    let supervisor = StreamSupervisor::new(
        Arc::new(connector),
        Arc::new(store.clone()),
        SupervisorSettings {
            reconcile_interval: Duration::from_secs(10),
            restart_backoff: Duration::from_millis(100),
            line_filter: "IOT_TELEMETRY".to_string(),
            max_line_buffer: 1024 * 1024,
            batch: BatchSettings {
                batch_size: 50,
                flush_interval: Duration::from_millis(50),
                max_queue: 5_000,
            },
        },
        stats.clone(),
    );

    let report = supervisor.reconcile(&registry).await.expect("reconcile");
    assert_eq!(report.started.len(), 2);

    let mut page = query(&store, "good", Some("10359715b333"), 0, 500)
        .await
        .expect("query");
    for _ in 0..50 {
        if page.events.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        page = query(&store, "good", Some("10359715b333"), 0, 500)
            .await
            .expect("query");
    }

    assert_eq!(page.events.len(), 2);
    assert_eq!(page.cursor, 1_700_000_001_000);

    let ranging = &page.events[0];
    assert_eq!(ranging.device_id, "10:35:97:15:b3:33");
    assert_eq!(ranging.compute_type, "CT_TDOA");
    assert_eq!(ranging.details["signalType"], "UWB");
    assert_eq!(ranging.details["iotTelemetry"]["detectedPosition"]["xPos"], 241.9);

    let placeholder = &page.events[1];
    assert_eq!(placeholder.compute_type, "CT_TDOA");
    assert_eq!(placeholder.details["signalType"], "BLE");

    let again = query(&store, "good", None, page.cursor, 500)
        .await
        .expect("query");
    assert!(again.events.is_empty());
    assert!(query(&store, "bad", None, 0, 500)
        .await
        .expect("query")
        .events
        .is_empty());

    let states = supervisor.snapshot().await;
    let bad = states
        .iter()
        .find(|state| state.tenant_id == "bad")
        .expect("bad tenant state");
    assert_ne!(bad.phase, StreamPhase::Streaming);
    assert!(bad.restarts >= 1);
    let good = states
        .iter()
        .find(|state| state.tenant_id == "good")
        .expect("good tenant state");
    assert_eq!(good.phase, StreamPhase::Streaming);
    assert_eq!(stats.snapshot().lines_malformed, 1);

    supervisor.shutdown().await;
    pool.close().await;
}
