//! Integration tests for `WorkerPool` behavior outside the headline
//! scenarios: outcomes, metrics, events, timeouts, session locks,
//! configuration errors and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agent_worker_pool::core::{
    BroadcastEventSink, ConcurrencyError, PoolEvent, TerminationReason, WorkerId, WorkerOutcome,
    WorkerPool, WorkerRequest, WorkerState,
};
use agent_worker_pool::process::in_memory::HeartbeatMode;
use serde_json::json;

use common::{config, factory, start, wait_until};

#[tokio::test]
async fn test_submit_round_trip() {
    let h = start(config()).await;

    let response = h
        .pool
        .submit(WorkerRequest::new(json!({ "text": "hello" })).with_tenant("telegram:42"))
        .await
        .unwrap();

    assert_eq!(response.worker_id, WorkerId(0));
    assert_eq!(
        response.outcome,
        WorkerOutcome::Success(json!({ "echo": { "text": "hello" } }))
    );
    assert_eq!(h.events.count("worker_spawned"), 1);
    assert_eq!(h.events.count("request_queued"), 1);
    assert_eq!(h.events.count("request_started"), 1);
    assert_eq!(h.events.count("request_completed"), 1);
}

#[tokio::test]
async fn test_worker_error_is_an_outcome() {
    let h = start(config()).await;

    let response = h
        .pool
        .submit(WorkerRequest::new(json!({ "fail": "model unavailable" })))
        .await
        .unwrap();
    assert_eq!(response.outcome, WorkerOutcome::Failure("model unavailable".into()));

    let completed = h
        .events
        .events()
        .into_iter()
        .find_map(|e| match e {
            PoolEvent::RequestCompleted(c) => Some(c),
            _ => None,
        })
        .unwrap();
    assert!(!completed.success);
    assert_eq!(completed.error.as_deref(), Some("model unavailable"));

    let metrics = h.pool.metrics();
    assert_eq!(metrics.total_processed, 1);
    assert_eq!(metrics.total_errors, 1);
}

#[tokio::test]
async fn test_metrics_before_any_work() {
    let h = start(config().with_min_workers(0)).await;
    let metrics = h.pool.metrics();
    assert_eq!(metrics.active_workers, 0);
    assert_eq!(metrics.idle_workers, 0);
    assert_eq!(metrics.queue_depth, 0);
    assert_eq!(metrics.total_processed, 0);
    assert_eq!(metrics.total_errors, 0);
    assert_eq!(metrics.p95_latency_ms, 0);
    assert_eq!(metrics.p99_latency_ms, 0);
    assert_eq!(metrics.stuck_workers, 0);
    assert!((metrics.avg_latency_ms - 0.0).abs() < f64::EPSILON);
    assert!((metrics.backpressure_level - 0.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_metrics_after_work() {
    let h = start(config().with_max_workers(1)).await;
    for _ in 0..3 {
        h.pool.submit(WorkerRequest::new(json!({}))).await.unwrap();
    }

    let metrics = h.pool.metrics();
    assert_eq!(metrics.total_processed, 3);
    assert_eq!(metrics.throughput_per_minute, 3);
    assert_eq!(metrics.idle_workers, 1);
    assert_eq!(metrics.active_workers, 0);
    assert!(metrics.p99_latency_ms >= metrics.p95_latency_ms);

    let value = serde_json::to_value(&metrics).unwrap();
    for key in [
        "active_workers",
        "idle_workers",
        "queue_depth",
        "total_processed",
        "total_errors",
        "avg_latency_ms",
        "p95_latency_ms",
        "p99_latency_ms",
        "throughput_per_minute",
        "backpressure_level",
        "stuck_workers",
    ] {
        assert!(value.get(key).is_some(), "missing metric {key}");
    }
}

#[tokio::test]
async fn test_broadcast_sink_sees_request_flow() {
    let (factory, _handler) = factory(HeartbeatMode::Disabled);
    let sink = Arc::new(BroadcastEventSink::new(64));
    let mut rx = sink.subscribe();
    let pool = WorkerPool::start_with_sink(config(), factory, sink).await.unwrap();

    pool.submit(WorkerRequest::new(json!({}))).await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec!["worker_spawned", "request_queued", "request_started", "request_completed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_caller_timeout_is_capped_by_config() {
    let h = start(config().with_worker_timeout_ms(50).with_max_workers(1)).await;

    let short = h
        .pool
        .submit(WorkerRequest::new(json!({ "hang": true })).with_id("short").with_timeout_ms(20))
        .await;
    assert_eq!(
        short,
        Err(ConcurrencyError::WorkerTimeout {
            request_id: "short".into(),
            waited_ms: 20
        })
    );

    let h = start(config().with_worker_timeout_ms(50).with_max_workers(1)).await;
    let long = h
        .pool
        .submit(WorkerRequest::new(json!({ "hang": true })).with_id("long").with_timeout_ms(10_000))
        .await;
    assert_eq!(
        long,
        Err(ConcurrencyError::WorkerTimeout {
            request_id: "long".into(),
            waited_ms: 50
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_requests_report_completion() {
    let h = start(config().with_max_workers(1).with_worker_timeout_ms(50)).await;

    let timed_out = h
        .pool
        .submit(WorkerRequest::new(json!({ "hang": true })).with_id("slow"))
        .await;
    assert!(matches!(timed_out, Err(ConcurrencyError::WorkerTimeout { .. })));

    // The only worker is suspect, so this one times out while queued.
    let queued = h
        .pool
        .submit(WorkerRequest::new(json!({})).with_id("queued"))
        .await;
    assert!(matches!(queued, Err(ConcurrencyError::WorkerTimeout { .. })));

    let completed: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PoolEvent::RequestCompleted(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].request_id, "slow");
    assert_eq!(completed[0].worker_id, Some(WorkerId(0)));
    assert!(!completed[0].success);
    assert_eq!(completed[0].error.as_deref(), Some("worker_timeout"));
    assert_eq!(completed[1].request_id, "queued");
    assert_eq!(completed[1].worker_id, None);
    assert_eq!(completed[1].error.as_deref(), Some("worker_timeout"));
    assert_eq!(h.pool.metrics().total_errors, 2);
}

#[tokio::test]
async fn test_abandoned_queued_submit_frees_its_slot() {
    let h = start(
        config()
            .with_min_workers(1)
            .with_max_workers(1)
            .with_max_queue_size(1),
    )
    .await;

    let pool = h.pool.clone();
    let _busy = tokio::spawn(async move {
        pool.submit(WorkerRequest::new(json!({ "hang": true }))).await
    });
    wait_until(|| h.pool.metrics().active_workers == 1).await;

    let pool = h.pool.clone();
    let abandoned = tokio::spawn(async move {
        pool.submit(WorkerRequest::new(json!({})).with_id("abandoned")).await
    });
    wait_until(|| h.pool.queue_depth() == 1).await;

    // A full queue turns normal work away.
    let rejected = h.pool.submit(WorkerRequest::new(json!({}))).await;
    assert!(matches!(rejected, Err(ConcurrencyError::Backpressure { .. })));

    abandoned.abort();
    wait_until(|| h.pool.queue_depth() == 0).await;
    assert!((h.pool.metrics().backpressure_level - 0.0).abs() < f64::EPSILON);

    let pool = h.pool.clone();
    let _next = tokio::spawn(async move {
        pool.submit(WorkerRequest::new(json!({})).with_id("next")).await
    });
    wait_until(|| h.pool.queue_depth() == 1).await;
    assert_eq!(h.events.count("request_started"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_returns_worker_to_service() {
    let h = start(config().with_worker_timeout_ms(50).with_max_workers(1)).await;

    let result = h.pool.submit(WorkerRequest::new(json!({ "sleep_ms": 100 }))).await;
    assert!(matches!(result, Err(ConcurrencyError::WorkerTimeout { .. })));
    assert!(h.pool.workers()[0].suspect);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let worker = &h.pool.workers()[0];
    assert!(!worker.suspect);
    assert_eq!(worker.state, WorkerState::Idle);
    assert_eq!(worker.requests_processed, 1);

    let response = h.pool.submit(WorkerRequest::new(json!({}))).await.unwrap();
    assert_eq!(response.worker_id, WorkerId(0));
}

#[tokio::test(start_paused = true)]
async fn test_session_lock_timeout() {
    let h = start(config().with_session_lock_timeout_ms(50)).await;

    let pool = h.pool.clone();
    let holder = tokio::spawn(async move {
        pool.submit(WorkerRequest::new(json!({ "sleep_ms": 200 })).with_session("s1"))
            .await
    });
    wait_until(|| h.events.count("request_started") == 1).await;

    let blocked = h
        .pool
        .submit(WorkerRequest::new(json!({})).with_session("s1"))
        .await;
    assert_eq!(
        blocked,
        Err(ConcurrencyError::LockAcquisition {
            session_id: "s1".into(),
            timeout_ms: 50
        })
    );
    assert!(holder.await.unwrap().is_ok());

    // Released on completion: the session is usable again.
    assert!(h
        .pool
        .submit(WorkerRequest::new(json!({})).with_session("s1"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (factory, _handler) = factory(HeartbeatMode::Disabled);
    let err = WorkerPool::start(config().with_min_workers(3).with_max_workers(1), factory)
        .await
        .unwrap_err();
    match err {
        ConcurrencyError::InvalidConfig(msg) => assert!(msg.contains("min_workers")),
        other => panic!("Expected InvalidConfig, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_rejects_and_is_idempotent() {
    let h = start(config()).await;

    h.pool.shutdown().await;
    h.pool.shutdown().await;
    assert!(h.pool.is_shutting_down());

    let err = h.pool.submit(WorkerRequest::new(json!({}))).await.unwrap_err();
    assert_eq!(err, ConcurrencyError::shutting_down());
    assert!(err.to_string().contains("shutting down"));

    assert!(h.pool.workers().is_empty());
    wait_until(|| h.factory.killed() == 1).await;
    assert_eq!(h.events.count("worker_recycled"), 1);
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_work_finish() {
    let h = start(config()).await;

    let pool = h.pool.clone();
    let in_flight = tokio::spawn(async move {
        pool.submit(WorkerRequest::new(json!({ "sleep_ms": 100 }))).await
    });
    wait_until(|| h.pool.metrics().active_workers == 1).await;

    h.pool.shutdown().await;
    assert!(in_flight.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_leftover_work() {
    let h = start(config().with_max_workers(1).with_shutdown_grace_ms(100)).await;

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let pool = h.pool.clone();
        tasks.push(tokio::spawn(async move {
            pool.submit(WorkerRequest::new(json!({ "hang": true }))).await
        }));
    }
    wait_until(|| h.pool.metrics().active_workers == 1 && h.pool.queue_depth() == 1).await;

    h.pool.shutdown().await;
    for task in tasks {
        assert_eq!(task.await.unwrap(), Err(ConcurrencyError::shutting_down()));
    }

    let reasons: Vec<_> = h
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PoolEvent::WorkerRecycled(r) => Some(r.reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![TerminationReason::Shutdown]);
}
