//! Metric emission checks.
//!
//! Installs the debugging recorder once per test process, drives every
//! instrumented code path through the public engine surface, and asserts
//! the emitted metric names. Tests here share process-global recorder and
//! subscriber state, so they run serially.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use risposta::telemetry::{self, LoggingSettings};
use risposta::{Backend, Batch, BodyChunk, CacheConfig, CacheEngine, MemoryBackend, ResponsePayload};
use serial_test::serial;

fn payload(status: u16, body: &str) -> ResponsePayload {
    ResponsePayload {
        status,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: BodyChunk::from(body),
    }
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let backend = Arc::new(MemoryBackend::new());
    let engine = CacheEngine::distributed(CacheConfig::default(), backend.clone(), None);

    // Hit, miss, and lookup latency
    engine
        .put("/hit", payload(200, "x"), 60_000.into(), None)
        .await
        .expect("stored");
    engine.get("/hit").await.expect("hit");
    assert!(engine.get("/missing").await.is_none());

    // Entry expiry notification
    engine
        .put("/short", payload(200, "gone"), 40.into(), None)
        .await
        .expect("stored");
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Malformed entry eviction
    engine
        .put("/corrupt", payload(200, "ok"), 60_000.into(), None)
        .await
        .expect("stored");
    backend
        .apply(Batch::new().hash_set(
            "/corrupt",
            vec![("status".to_string(), b"banana".to_vec())],
        ))
        .await
        .expect("corrupt the entry");
    assert!(engine.get("/corrupt").await.is_none());

    // Lock contention and streamed commit latency
    let mut winner = engine.open_writer("/stream", 60_000.into(), None).await;
    let loser = engine.open_writer("/stream", 60_000.into(), None).await;
    assert!(!loser.is_recording());
    winner.write("streamed body").await;
    winner.commit(200, vec![]).await.expect("stored");
    loser.abort().await;

    // Aborted transfer
    let mut aborted = engine.open_writer("/aborted", 60_000.into(), None).await;
    aborted.write("partial").await;
    aborted.abort().await;

    // Backend fault on the lookup path
    backend.set_available(false);
    assert!(engine.get("/hit").await.is_none());
    backend.set_available(true);

    // Clears
    assert_eq!(engine.delete("/hit").await.expect("clear"), 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "risposta_hit_total",
        "risposta_miss_total",
        "risposta_entry_expired_total",
        "risposta_malformed_entry_total",
        "risposta_lock_contention_total",
        "risposta_transfer_abort_total",
        "risposta_backend_error_total",
        "risposta_cleared_total",
        "risposta_lookup_ms",
        "risposta_commit_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[test]
#[serial]
fn telemetry_init_installs_exactly_once() {
    telemetry::init(&LoggingSettings::default()).expect("first install succeeds");
    telemetry::init(&LoggingSettings::default()).expect_err("second install is rejected");
}
