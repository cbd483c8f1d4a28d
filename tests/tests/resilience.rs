use loomflow_foundation::workflow::{
    CircuitBreakerRegistry, EngineConfig, Workflow, WorkflowBuilder,
};
use loomflow_kernel::workflow::{
    CircuitBreakerConfig, CircuitState, ErrorKind, NodeError, RetryPolicy, ToolError,
    WorkflowValue,
};
use loomflow_testing::{FlakyNode, MockTool, RecordingHooks};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn retry_succeeds_on_fourth_call() {
    let flaky = FlakyNode::new("fetch", 3, 42i64);
    let calls = flaky.counter();
    let hooks = RecordingHooks::new();

    let workflow = WorkflowBuilder::new("retrying")
        .hooks(Arc::new(hooks.clone()))
        .node(Arc::new(flaky))
        .with_retry("fetch", RetryPolicy::new(3, 100))
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    assert!(result.is_completed());
    assert_eq!(result.final_output, Some(WorkflowValue::Int(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // three absorbed attempts, reported but not fatal
    assert_eq!(hooks.errors_for("fetch").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_after_max_retries() {
    let flaky = FlakyNode::new("fetch", 10, 1i64);
    let calls = flaky.counter();
    let workflow = WorkflowBuilder::new("exhausted")
        .node(Arc::new(flaky))
        .with_retry("fetch", RetryPolicy::new(2, 50).constant())
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Network);
    assert_eq!(failure.node.as_deref(), Some("fetch"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn fallback_returns_secondary_and_reports_primary() {
    let hooks = RecordingHooks::new();
    let primary = FlakyNode::always_failing("a", NodeError::permanent("schema mismatch"));
    let workflow = WorkflowBuilder::new("fallback")
        .hooks(Arc::new(hooks.clone()))
        .node(Arc::new(primary))
        .with_fallback("a", Arc::new(FlakyNode::new("b", 0, "from b")))
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    assert!(result.is_completed());
    assert_eq!(result.final_output, Some(WorkflowValue::from("from b")));
    assert_eq!(result.outputs.value("a"), Some(&WorkflowValue::from("from b")));

    let observed = hooks.errors_for("a");
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].kind, ErrorKind::InvalidInput);
}

#[tokio::test(start_paused = true)]
async fn tool_timeout_falls_back_to_payload() {
    let tool = Arc::new(MockTool::new("search"));
    let workflow = WorkflowBuilder::new("bounded")
        .task("slow", |_input, _ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, NodeError>(WorkflowValue::from("late"))
        })
        .with_timeout_or("slow", Duration::from_millis(200), "stale")
        .tool("search", tool.clone())
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    assert!(result.is_completed());
    assert_eq!(tool.history().await, vec![WorkflowValue::from("stale")]);
}

#[tokio::test]
async fn fatal_tool_error_is_not_retried() {
    let tool = Arc::new(MockTool::new("deploy"));
    tool.set_result(Err(ToolError::fatal("quota exhausted"))).await;
    let workflow = WorkflowBuilder::new("deploy")
        .tool("deploy", tool.clone())
        .with_retry("deploy", RetryPolicy::new(5, 1))
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::Tool);
    assert_eq!(tool.call_count().await, 1);
}

fn guarded(registry: &Arc<CircuitBreakerRegistry>, calls: &Arc<AtomicU32>) -> Workflow {
    let counter = Arc::clone(calls);
    WorkflowBuilder::new("guarded")
        .task("call", move |_input, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<WorkflowValue, _>(NodeError::transient("upstream 503"))
            }
        })
        .with_circuit_breaker("call", "upstream")
        .breaker_registry(Arc::clone(registry))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_threshold_and_admits_one_probe() {
    let mut breakers = HashMap::new();
    breakers.insert("upstream".to_string(), CircuitBreakerConfig::new(3, 1_000));
    let config = EngineConfig {
        breakers,
        ..EngineConfig::default()
    };
    let registry = Arc::new(config.breaker_registry());
    let calls = Arc::new(AtomicU32::new(0));
    let workflow = guarded(&registry, &calls);

    for _ in 0..3 {
        let result = workflow.run(WorkflowValue::Null).await;
        assert_eq!(result.failure().unwrap().kind, ErrorKind::Network);
    }
    assert_eq!(registry.breaker("upstream").state(), CircuitState::Open);

    let rejected = workflow.run(WorkflowValue::Null).await;
    assert_eq!(rejected.failure().unwrap().kind, ErrorKind::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_millis(1_001)).await;

    let (first, second) = tokio::join!(
        workflow.run(WorkflowValue::Null),
        workflow.run(WorkflowValue::Null)
    );
    let mut kinds = vec![first.failure().unwrap().kind, second.failure().unwrap().kind];
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(kinds, vec![ErrorKind::CircuitOpen, ErrorKind::Network]);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(registry.breaker("upstream").state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn breaker_state_is_shared_between_workflows() {
    let registry = Arc::new(CircuitBreakerRegistry::with_configs(HashMap::from([(
        "upstream".to_string(),
        CircuitBreakerConfig::new(2, 500),
    )])));
    let calls = Arc::new(AtomicU32::new(0));
    let one = guarded(&registry, &calls);
    let two = guarded(&registry, &calls);

    one.run(WorkflowValue::Null).await;
    two.run(WorkflowValue::Null).await;

    let rejected = one.run(WorkflowValue::Null).await;
    assert_eq!(rejected.failure().unwrap().kind, ErrorKind::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    registry.reset_all();
    assert_eq!(registry.breaker("upstream").state(), CircuitState::Closed);
}
