use std::sync::Arc;
use std::time::Duration;

use taskgate_core::{
    config::RateLimitEntry, AppConfig, Clock, DeadLetterStore, DispatchError, FailureReason,
    ManualClock, Outcome, TaskExecutor,
};
use taskgate_dispatcher::{CircuitState, Dispatcher};
use taskgate_testing_utils::{
    manual_clock, FaultyDeadLetterStore, InMemoryDeadLetterStore, InMemoryRetryQueue,
    InMemoryRouteHealthStore, RejectingPolicy, ScriptedExecutor, TaskBuilder,
};

struct Harness {
    dispatcher: Dispatcher,
    dead_letters: Arc<InMemoryDeadLetterStore>,
    retries: Arc<InMemoryRetryQueue>,
    clock: Arc<ManualClock>,
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.dispatcher.capabilities = vec!["compute".into(), "storage".into()];
    config
}

async fn harness(config: AppConfig) -> Harness {
    let clock = manual_clock();
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let retries = Arc::new(InMemoryRetryQueue::new(clock.clone()));
    let dispatcher = Dispatcher::builder(config)
        .clock(clock.clone())
        .dead_letter_store(dead_letters.clone())
        .retry_scheduler(retries.clone())
        .route_health_store(Arc::new(InMemoryRouteHealthStore::new()))
        .build()
        .await
        .unwrap();
    Harness {
        dispatcher,
        dead_letters,
        retries,
        clock,
    }
}

fn compute_task(h: &Harness, id: &str, resource_key: &str) -> taskgate_core::Task {
    TaskBuilder::new()
        .with_id(id)
        .with_capabilities(h.dispatcher.catalog(), &["compute"])
        .with_resource_key(resource_key)
        .build()
}

async fn add_worker(h: &Harness, id: &str, executor: &ScriptedExecutor) {
    let executor: Arc<dyn TaskExecutor> = Arc::new(executor.clone());
    h.dispatcher
        .register_worker(id, ["compute"], executor)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unlimited_resource_completes_without_state() {
    let h = harness(config()).await;
    let executor = ScriptedExecutor::always_ok(serde_json::json!({"settled": true}));
    add_worker(&h, "w1", &executor).await;

    let outcome = h.dispatcher.submit(compute_task(&h, "t-1", "X")).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Completed {
            worker_id: "w1".into(),
            result: serde_json::json!({"settled": true}),
        }
    );

    let status = h.dispatcher.status().await;
    assert!(status.buckets.is_empty());
    assert!(status.circuits.is_empty());
    assert_eq!(status.workers[0].workload, 0);
    assert_eq!(status.workers[0].completed, 1);
}

#[tokio::test]
async fn test_policy_rejection_has_no_side_effects() {
    let clock = manual_clock();
    let policy = RejectingPolicy::new("sanctioned");
    let dispatcher = Dispatcher::builder(config())
        .clock(clock.clone())
        .policy(Arc::new(policy.clone()))
        .dead_letter_store(Arc::new(InMemoryDeadLetterStore::new()))
        .retry_scheduler(Arc::new(InMemoryRetryQueue::new(clock)))
        .build()
        .await
        .unwrap();
    let executor = ScriptedExecutor::always_ok(serde_json::json!(null));
    dispatcher
        .register_worker("w1", ["compute"], Arc::new(executor.clone()))
        .await
        .unwrap();

    let task = TaskBuilder::new()
        .with_capabilities(dispatcher.catalog(), &["compute"])
        .build();
    let outcome = dispatcher.submit(task).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Blocked {
            reason: "sanctioned".into()
        }
    );
    assert_eq!(policy.evaluations(), 1);
    assert_eq!(executor.calls(), 0);
    assert_eq!(dispatcher.registry().get("w1").await.unwrap().workload, 0);
    assert!(dispatcher.routes().is_none());
}

#[tokio::test]
async fn test_no_eligible_worker() {
    let h = harness(config()).await;
    let executor = ScriptedExecutor::always_ok(serde_json::json!(null));
    add_worker(&h, "w1", &executor).await;

    let task = TaskBuilder::new()
        .with_capabilities(h.dispatcher.catalog(), &["compute", "storage"])
        .build();
    let outcome = h.dispatcher.submit(task).await.unwrap();
    assert_eq!(outcome, Outcome::Failed(FailureReason::NoWorkerAvailable));
    assert!(h.dead_letters.is_empty().await);
}

#[tokio::test]
async fn test_undeclared_capability_is_an_error() {
    let h = harness(config()).await;
    let foreign = taskgate_core::CapabilityCatalog::new(["gpu"]);
    let task = TaskBuilder::new().with_capabilities(&foreign, &["gpu"]).build();

    let err = h.dispatcher.submit(task).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownCapability(tag) if tag == "gpu"));
}

#[tokio::test]
async fn test_rate_limited_releases_worker() {
    let h = harness(config()).await;
    h.dispatcher.register_limit("X", 1.0, 1.0).await.unwrap();
    let executor = ScriptedExecutor::always_ok(serde_json::json!(null));
    add_worker(&h, "w1", &executor).await;

    assert!(h
        .dispatcher
        .submit(compute_task(&h, "t-1", "X"))
        .await
        .unwrap()
        .is_completed());
    let outcome = h.dispatcher.submit(compute_task(&h, "t-2", "X")).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::RateLimited {
            retry_after: Duration::from_secs(1)
        }
    );
    assert_eq!(executor.calls(), 1);
    assert_eq!(h.dispatcher.registry().get("w1").await.unwrap().workload, 0);

    h.clock.advance(Duration::from_secs(1));
    assert!(h
        .dispatcher
        .submit(compute_task(&h, "t-2", "X"))
        .await
        .unwrap()
        .is_completed());
}

#[tokio::test]
async fn test_transient_failure_is_handed_to_scheduler() {
    let h = harness(config()).await;
    let executor = ScriptedExecutor::new(vec![Err(DispatchError::Timeout("bank api".into()))])
        .with_fallback(Ok(serde_json::json!("ok")));
    add_worker(&h, "w1", &executor).await;

    let outcome = h.dispatcher.submit(compute_task(&h, "t-1", "X")).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Retrying {
            delay: Duration::from_secs(2),
            attempts: 1
        }
    );
    assert_eq!(h.retries.len().await, 1);
    assert!(h.retries.take_due(h.clock.now()).await.is_empty());

    h.clock.advance(Duration::from_secs(2));
    let mut due = h.retries.take_due(h.clock.now()).await;
    assert_eq!(due.len(), 1);
    let task = due.remove(0);
    assert_eq!(task.attempts, 1);

    assert!(h.dispatcher.submit(task).await.unwrap().is_completed());
    assert_eq!(executor.calls(), 2);
    assert!(h.dead_letters.is_empty().await);
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_once() {
    let h = harness(config()).await;
    let executor =
        ScriptedExecutor::always_err(DispatchError::Validation("missing amount".into()));
    add_worker(&h, "w1", &executor).await;

    let outcome = h.dispatcher.submit(compute_task(&h, "t-1", "X")).await.unwrap();
    assert!(matches!(outcome, Outcome::DeadLettered { ref error } if error.contains("missing amount")));
    assert!(h.retries.is_empty().await);

    // 再次提交同一任务不会产生第二条死信
    let outcome = h.dispatcher.submit(compute_task(&h, "t-1", "X")).await.unwrap();
    assert!(matches!(outcome, Outcome::Failed(FailureReason::Aborted { .. })));

    let records = h.dead_letters.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task.attempts, 1);
    assert_eq!(h.dispatcher.registry().get("w1").await.unwrap().workload, 0);
}

#[tokio::test]
async fn test_retries_exhausted_then_dead_lettered() {
    let mut config = config();
    config.circuit_breaker.failure_threshold = 100;
    let h = harness(config).await;
    let executor = ScriptedExecutor::always_err(DispatchError::execution("ECONNRESET"));
    add_worker(&h, "w1", &executor).await;

    let mut task = compute_task(&h, "t-1", "X");
    for expected_secs in [2, 4, 8, 16, 32] {
        let outcome = h.dispatcher.submit(task).await.unwrap();
        assert!(
            matches!(outcome, Outcome::Retrying { delay, .. } if delay == Duration::from_secs(expected_secs))
        );
        h.clock.advance(Duration::from_secs(expected_secs));
        task = h.retries.take_due(h.clock.now()).await.remove(0);
    }

    let outcome = h.dispatcher.submit(task).await.unwrap();
    assert!(matches!(outcome, Outcome::DeadLettered { .. }));
    let records = h.dead_letters.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task.attempts, 6);
    assert_eq!(executor.calls(), 6);
}

#[tokio::test]
async fn test_open_circuit_short_circuits_without_attempt() {
    let mut config = config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.reset_timeout_ms = 100;
    let h = harness(config).await;
    let executor = ScriptedExecutor::always_err(DispatchError::Timeout("slow".into()));
    add_worker(&h, "w1", &executor).await;

    for i in 0..3 {
        let outcome = h
            .dispatcher
            .submit(compute_task(&h, &format!("t-{i}"), "X"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Retrying { .. }));
    }
    assert_eq!(h.dispatcher.circuit_breaker().state("X").await, CircuitState::Open);

    let outcome = h.dispatcher.submit(compute_task(&h, "t-3", "X")).await.unwrap();
    match outcome {
        Outcome::Failed(FailureReason::CircuitOpen { operation, .. }) => {
            assert_eq!(operation, "X")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(executor.calls(), 3);
    assert_eq!(h.retries.len().await, 3);
    assert!(h.dead_letters.is_empty().await);
    assert_eq!(h.dispatcher.registry().get("w1").await.unwrap().workload, 0);

    // 另一个资源键不受影响
    let outcome = h.dispatcher.submit(compute_task(&h, "t-4", "Y")).await.unwrap();
    assert!(matches!(outcome, Outcome::Retrying { .. }));
    assert_eq!(executor.calls(), 4);

    h.clock.advance(Duration::from_millis(100));
    h.dispatcher.submit(compute_task(&h, "t-5", "X")).await.unwrap();
    assert_eq!(executor.calls(), 5);
}

#[tokio::test]
async fn test_throttle_extends_admission_backoff() {
    let h = harness(config()).await;
    h.dispatcher.register_limit("X", 10.0, 1.0).await.unwrap();
    let executor = ScriptedExecutor::new(vec![Err(DispatchError::execution(
        "HTTP 429 Too Many Requests",
    ))])
    .with_fallback(Ok(serde_json::json!("ok")));
    add_worker(&h, "w1", &executor).await;

    let outcome = h.dispatcher.submit(compute_task(&h, "t-1", "X")).await.unwrap();
    assert!(matches!(outcome, Outcome::Retrying { .. }));

    let outcome = h.dispatcher.submit(compute_task(&h, "t-2", "X")).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::RateLimited {
            retry_after: Duration::from_secs(2)
        }
    );

    h.clock.advance(Duration::from_secs(2));
    assert!(h
        .dispatcher
        .submit(compute_task(&h, "t-2", "X"))
        .await
        .unwrap()
        .is_completed());
    let status = h.dispatcher.status().await;
    assert!(status.buckets[0].backoff_until.is_none());
}

#[tokio::test]
async fn test_independent_keys_dispatch_concurrently() {
    let h = harness(config()).await;
    let executor = ScriptedExecutor::always_ok(serde_json::json!(1))
        .with_delay(Duration::from_millis(20));
    add_worker(&h, "w1", &executor).await;
    add_worker(&h, "w2", &executor).await;

    let (a, b) = tokio::join!(
        h.dispatcher.submit(compute_task(&h, "t-a", "A")),
        h.dispatcher.submit(compute_task(&h, "t-b", "B")),
    );
    assert!(a.unwrap().is_completed());
    assert!(b.unwrap().is_completed());
    for worker in h.dispatcher.registry().workers().await {
        assert_eq!(worker.workload, 0);
    }
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn test_submit_batch_preserves_order() {
    let h = harness(config()).await;
    h.dispatcher.register_limit("X", 2.0, 1.0).await.unwrap();
    let executor = ScriptedExecutor::always_ok(serde_json::json!("ok"));
    add_worker(&h, "w1", &executor).await;

    let tasks = (0..3)
        .map(|i| compute_task(&h, &format!("t-{i}"), "X"))
        .collect();
    let outcomes: Vec<_> = h
        .dispatcher
        .submit_batch(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes.iter().filter(|o| o.is_completed()).count(), 2);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::RateLimited { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_route_failover_through_dispatcher() {
    let mut config = config();
    config.routes.routes = vec![
        taskgate_core::config::RouteEntry {
            name: "A".into(),
            weight: 10,
        },
        taskgate_core::config::RouteEntry {
            name: "B".into(),
            weight: 5,
        },
    ];
    let h = harness(config).await;
    let routes = h.dispatcher.routes().unwrap().clone();

    let used = routes
        .with_failover(
            |route| async move {
                if route == "A" {
                    Err(DispatchError::Unavailable("A down".into()))
                } else {
                    Ok(route)
                }
            },
            routes.max_tries(),
        )
        .await
        .unwrap();
    assert_eq!(used, "B");
    assert_eq!(routes.pick_route().await.unwrap().route, "B");

    let status = h.dispatcher.status().await;
    assert_eq!(status.routes.len(), 2);
    assert!(status.routes.iter().any(|r| r.name == "A" && r.cooling));
    assert!(status.to_json().unwrap().contains("\"cooling\": true"));
}

#[tokio::test]
async fn test_cancelled_submit_releases_worker_and_probe() {
    let mut config = config();
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.reset_timeout_ms = 100;
    let h = harness(config).await;

    let failing = ScriptedExecutor::always_err(DispatchError::Timeout("slow".into()));
    add_worker(&h, "w1", &failing).await;
    h.dispatcher.submit(compute_task(&h, "t-0", "X")).await.unwrap();
    assert_eq!(h.dispatcher.circuit_breaker().state("X").await, CircuitState::Open);
    h.dispatcher.registry().deregister("w1").await.unwrap();

    let hanging = ScriptedExecutor::always_ok(serde_json::json!("late"))
        .with_delay(Duration::from_secs(10));
    add_worker(&h, "w2", &hanging).await;
    h.clock.advance(Duration::from_millis(100));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        h.dispatcher.submit(compute_task(&h, "t-1", "X")),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(hanging.calls(), 1);
    assert_eq!(h.dispatcher.registry().get("w2").await.unwrap().workload, 0);
    assert_eq!(h.dispatcher.circuit_breaker().state("X").await, CircuitState::HalfOpen);

    // the next submission becomes the probe straight away
    h.dispatcher.registry().deregister("w2").await.unwrap();
    let healthy = ScriptedExecutor::always_ok(serde_json::json!("ok"));
    add_worker(&h, "w3", &healthy).await;
    let outcome = h.dispatcher.submit(compute_task(&h, "t-2", "X")).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.dispatcher.circuit_breaker().state("X").await, CircuitState::Closed);
}

#[tokio::test]
async fn test_invalid_limits_are_rejected() {
    let h = harness(config()).await;
    for (max_tokens, rate) in [(-1.0, 1.0), (f64::NAN, 1.0), (10.0, 0.0)] {
        let err = h
            .dispatcher
            .register_limit("X", max_tokens, rate)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }
    let executor = ScriptedExecutor::always_ok(serde_json::json!(null));
    add_worker(&h, "w1", &executor).await;
    assert!(h
        .dispatcher
        .submit(compute_task(&h, "t-1", "X"))
        .await
        .unwrap()
        .is_completed());

    let mut config = config();
    config.rate_limits.push(RateLimitEntry::new("X", -1.0, 1.0));
    let clock = manual_clock();
    let result = Dispatcher::builder(config)
        .clock(clock.clone())
        .dead_letter_store(Arc::new(InMemoryDeadLetterStore::new()))
        .retry_scheduler(Arc::new(InMemoryRetryQueue::new(clock)))
        .build()
        .await;
    assert!(matches!(result, Err(DispatchError::Validation(_))));
}

#[tokio::test]
async fn test_dead_letter_write_failure_is_an_error() {
    let clock = manual_clock();
    let dead_letters = Arc::new(FaultyDeadLetterStore::new());
    let retries = Arc::new(InMemoryRetryQueue::new(clock.clone()));
    let dispatcher = Dispatcher::builder(config())
        .clock(clock)
        .dead_letter_store(dead_letters.clone())
        .retry_scheduler(retries.clone())
        .build()
        .await
        .unwrap();
    let executor = ScriptedExecutor::always_err(DispatchError::Validation("missing amount".into()));
    dispatcher
        .register_worker("w1", ["compute"], Arc::new(executor.clone()))
        .await
        .unwrap();
    let task = TaskBuilder::new()
        .with_id("t-1")
        .with_capabilities(dispatcher.catalog(), &["compute"])
        .build();

    dead_letters.set_failing(true);
    let err = dispatcher.submit(task.clone()).await.unwrap_err();
    assert!(matches!(err, DispatchError::Storage(_)));
    assert!(dead_letters.list().await.unwrap().is_empty());
    assert!(retries.is_empty().await);
    assert_eq!(dispatcher.registry().get("w1").await.unwrap().workload, 0);

    // nothing was remembered, so the task can still be dead-lettered
    dead_letters.set_failing(false);
    let outcome = dispatcher.submit(task).await.unwrap();
    assert!(matches!(outcome, Outcome::DeadLettered { .. }));
    assert_eq!(dead_letters.list().await.unwrap().len(), 1);
}
