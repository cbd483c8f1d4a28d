use futures::future::BoxFuture;
use loomflow_foundation::workflow::{
    EngineConfig, ExecutorConfig, FnNode, MapFailurePolicy, MapReduceSpec, WorkflowBuilder,
};
use loomflow_kernel::workflow::{ErrorKind, NodeContext, NodeError, WorkflowValue};
use loomflow_testing::RecordingHooks;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type TaskFuture = BoxFuture<'static, Result<WorkflowValue, NodeError>>;

async fn echo(input: WorkflowValue, _ctx: NodeContext) -> Result<WorkflowValue, NodeError> {
    Ok(input)
}

fn sleeper(
    ms: u64,
    value: &'static str,
) -> impl Fn(WorkflowValue, NodeContext) -> TaskFuture + Send + Sync + 'static {
    move |_input, _ctx| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(WorkflowValue::from(value))
        })
    }
}

fn integers(range: std::ops::RangeInclusive<i64>) -> WorkflowValue {
    WorkflowValue::List(range.map(WorkflowValue::Int).collect())
}

#[tokio::test(start_paused = true)]
async fn join_waits_for_the_slowest_sibling() {
    let hooks = RecordingHooks::new();
    let workflow = WorkflowBuilder::new("barrier")
        .hooks(Arc::new(hooks.clone()))
        .task("split", echo)
        .fan_out()
        .task("fast_a", sleeper(10, "a"))
        .goto("split")
        .task("fast_b", sleeper(20, "b"))
        .goto("split")
        .task("slow_c", sleeper(500, "c"))
        .detach()
        .transform("join", |input, _| Ok(input))
        .edge("fast_a", "join")
        .edge("fast_b", "join")
        .edge("slow_c", "join")
        .start("split")
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    assert!(result.is_completed());

    let joined = result.final_output.unwrap();
    let joined = joined.as_map().unwrap();
    assert_eq!(joined.len(), 3);
    assert_eq!(joined["slow_c"], WorkflowValue::from("c"));
    assert_eq!(
        hooks.started(),
        ["split", "fast_a", "fast_b", "slow_c", "join"]
    );
    assert_eq!(
        result.outputs.trace().iter().filter(|n| *n == "join").count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn frontier_respects_max_parallelism() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let config = EngineConfig {
        executor: ExecutorConfig {
            max_parallelism: 2,
            ..ExecutorConfig::default()
        },
        ..EngineConfig::default()
    };

    let mut builder = WorkflowBuilder::new("bounded")
        .config(config)
        .task("split", echo)
        .fan_out();
    for i in 0..6 {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        builder = builder.goto("split").task(format!("worker_{i}"), move |_input, _ctx| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, NodeError>(WorkflowValue::Int(i))
            }
        });
    }
    builder = builder.detach().task("join", echo);
    for i in 0..6 {
        builder = builder.edge(format!("worker_{i}"), "join");
    }
    let workflow = builder.start("split").build().unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    assert!(result.is_completed());
    assert_eq!(result.final_output.unwrap().as_map().unwrap().len(), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn map_reduce_keeps_input_order() {
    // later items finish first
    let map = FnNode::new("scale", |input: WorkflowValue, _ctx: NodeContext| async move {
        let n = input.as_i64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(((6 - n) * 10) as u64)).await;
        Ok::<_, NodeError>(WorkflowValue::Int(n * 10))
    });
    let reduce = FnNode::transform("collect", |input, _| Ok(input));
    let workflow = WorkflowBuilder::new("ordered")
        .map_reduce(
            "scale_all",
            MapReduceSpec::new(Arc::new(map), Arc::new(reduce)).max_concurrency(5),
        )
        .build()
        .unwrap();

    let result = workflow.run(integers(1..=5)).await;
    let expected = WorkflowValue::List((1..=5).map(|n| WorkflowValue::Int(n * 10)).collect());
    assert_eq!(result.final_output, Some(expected));
    let elements = result.outputs.element_results("scale_all");
    assert_eq!(elements.len(), 5);
    assert_eq!(elements[0].value(), Some(&WorkflowValue::Int(10)));
    assert_eq!(elements[4].value(), Some(&WorkflowValue::Int(50)));
}

#[tokio::test]
async fn map_reduce_collect_hands_failures_to_the_reducer() {
    let hooks = RecordingHooks::new();
    let map = FnNode::transform("check", |input, _| match input.as_i64() {
        Some(n) if n % 2 == 0 => Err(NodeError::validation(format!("{n} is even"))),
        Some(n) => Ok(WorkflowValue::Int(n)),
        None => Err(NodeError::validation("not a number")),
    });
    let reduce = FnNode::transform("summarize", |input, _| {
        let items = input.as_list().unwrap_or_default();
        let failed = items.iter().filter(|v| v.get("error").is_some()).count();
        Ok(WorkflowValue::map([
            ("ok", WorkflowValue::from(items.len() - failed)),
            ("failed", WorkflowValue::from(failed)),
        ]))
    });
    let workflow = WorkflowBuilder::new("collecting")
        .hooks(Arc::new(hooks.clone()))
        .map_reduce(
            "check_all",
            MapReduceSpec::new(Arc::new(map), Arc::new(reduce)).policy(MapFailurePolicy::Collect),
        )
        .build()
        .unwrap();

    let result = workflow.run(integers(1..=5)).await;
    assert!(result.is_completed());
    let summary = result.final_output.unwrap();
    assert_eq!(summary.get("ok"), Some(&WorkflowValue::Int(3)));
    assert_eq!(summary.get("failed"), Some(&WorkflowValue::Int(2)));
    assert_eq!(hooks.errors_for("check_all").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn parallel_fail_fast_cancels_siblings() {
    let started = tokio::time::Instant::now();
    let workflow = WorkflowBuilder::new("fail-fast")
        .parallel("group")
        .branch("broken", |_input, _ctx| async {
            Err::<WorkflowValue, _>(NodeError::permanent("bad request"))
        })
        .branch("slow", sleeper(10_000, "done"))
        .fail_fast(true)
        .join()
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::InvalidInput);
    assert_eq!(failure.node.as_deref(), Some("group"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        result.outputs.output("slow").and_then(|r| r.error()).map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_a_running_workflow() {
    let workflow = WorkflowBuilder::new("cancellable")
        .task("prepare", echo)
        .task("wait", sleeper(60_000, "never"))
        .task("after", echo)
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let run = {
        let workflow = workflow.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { workflow.run_with_cancel("go", cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = run.await.unwrap();
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.node.as_deref(), Some("wait"));
    assert!(!result.outputs.has_result("after"));
}
