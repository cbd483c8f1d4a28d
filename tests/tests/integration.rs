use loomflow_foundation::workflow::{
    ChannelHooks, EngineConfig, ExecutionEvent, ExecutorConfig, WorkflowBuilder,
};
use loomflow_kernel::workflow::{
    Checkpoint, CheckpointSink, ErrorKind, ModelConfig, NodeContext, NodeError, ProviderError,
    ToolExecutor, WorkflowValue,
};
use loomflow_testing::hooks::HookEvent;
use loomflow_testing::{MockLlmClient, MockTool, MockValidator, RecordingHooks};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

async fn echo(input: WorkflowValue, _ctx: NodeContext) -> Result<WorkflowValue, NodeError> {
    Ok(input)
}

fn init() {
    loomflow_kernel::logging::init_logging("loomflow=debug");
}

#[tokio::test]
async fn fetch_transform_report_end_to_end() {
    init();
    let fetch = Arc::new(MockTool::new("fetch"));
    fetch
        .set_result(Ok(WorkflowValue::from(json!({ "n": 5 }))))
        .await;

    let workflow = WorkflowBuilder::new("report")
        .tool("fetch", fetch.clone())
        .transform("transform", |input, _ctx| {
            let n = input.get("n").and_then(WorkflowValue::as_i64).unwrap_or(0);
            Ok(WorkflowValue::map([("n", WorkflowValue::Int(n * 2))]))
        })
        .transform("report", |_input, ctx| {
            let doubled: serde_json::Value = ctx.decode("transform")?;
            Ok(WorkflowValue::from(format!("value={}", doubled["n"])))
        })
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Map(Default::default())).await;

    assert!(result.is_completed());
    assert_eq!(result.final_output, Some(WorkflowValue::from("value=10")));
    assert_eq!(
        result.outputs.value("transform"),
        Some(&WorkflowValue::map([("n", WorkflowValue::Int(10))]))
    );
    assert_eq!(result.outputs.trace(), ["fetch", "transform", "report"]);
    loomflow_testing::assert_tool_called!(fetch, 1);
}

#[tokio::test]
async fn identical_runs_produce_identical_outputs() {
    let workflow = WorkflowBuilder::new("deterministic")
        .transform("square", |input, _| {
            let n = input.as_i64().unwrap_or(0);
            Ok(WorkflowValue::Int(n * n))
        })
        .parallel("fan")
        .branch("plus", |input: WorkflowValue, _ctx| async move {
            Ok::<_, NodeError>(WorkflowValue::Int(input.as_i64().unwrap_or(0) + 1))
        })
        .branch("minus", |input: WorkflowValue, _ctx| async move {
            Ok::<_, NodeError>(WorkflowValue::Int(input.as_i64().unwrap_or(0) - 1))
        })
        .join()
        .build()
        .unwrap();

    let first = workflow.run(7i64).await;
    let second = workflow.run(7i64).await;

    assert_ne!(first.execution_id, second.execution_id);
    assert_eq!(first.final_output, second.final_output);
    assert_eq!(first.outputs.outputs(), second.outputs.outputs());
    assert_eq!(first.outputs.trace(), second.outputs.trace());
    assert_eq!(
        first.final_output.unwrap().get("plus"),
        Some(&WorkflowValue::Int(50))
    );
}

#[tokio::test]
async fn condition_loop_exits_on_iteration_count() {
    let workflow = WorkflowBuilder::new("bounded-loop")
        .transform("body", |input, _| Ok(input))
        .condition("again", |_, ctx| ctx.iteration("body") < 2)
        .on_true_to("body")
        .on_false("done", echo)
        .end_condition()
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Int(0)).await;
    assert!(result.is_completed());
    assert_eq!(result.outputs.iteration("body"), 2);
    assert_eq!(
        result.outputs.trace(),
        ["body", "again", "body", "again", "body", "again", "done"]
    );
    assert_eq!(result.final_output, Some(WorkflowValue::from("false")));
}

#[tokio::test]
async fn unbounded_loop_hits_iteration_limit() {
    let config = EngineConfig {
        executor: ExecutorConfig {
            max_iterations: 25,
            ..ExecutorConfig::default()
        },
        ..EngineConfig::default()
    };
    let hooks = RecordingHooks::new();
    let workflow = WorkflowBuilder::new("spin")
        .config(config)
        .hooks(Arc::new(hooks.clone()))
        .transform("body", |input, _| Ok(input))
        .condition("again", |_, _| true)
        .on_true_to("body")
        .on_false("done", echo)
        .end_condition()
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::IterationLimitExceeded);
    assert_eq!(result.outputs.trace().len(), 25);
    assert!(result.final_output.is_none());
    assert_eq!(hooks.terminal_count(), 1);
}

#[tokio::test]
async fn switch_routes_by_key_and_default() {
    let workflow = WorkflowBuilder::new("router")
        .switch("route", |input, _| {
            input
                .get("kind")
                .and_then(WorkflowValue::as_str)
                .unwrap_or_default()
                .to_string()
        })
        .case("refund", "refunds", |_input, _ctx| async {
            Ok::<_, NodeError>(WorkflowValue::from("refund queued"))
        })
        .case("question", "answers", |_input, _ctx| async {
            Ok::<_, NodeError>(WorkflowValue::from("answered"))
        })
        .default("triage", |_input, _ctx| async {
            Ok::<_, NodeError>(WorkflowValue::from("sent to triage"))
        })
        .merge("reply", echo)
        .build()
        .unwrap();

    let refund = workflow
        .run(WorkflowValue::map([("kind", WorkflowValue::from("refund"))]))
        .await;
    assert_eq!(refund.final_output, Some(WorkflowValue::from("refund queued")));
    assert!(!refund.outputs.has_result("answers"));

    let other = workflow
        .run(WorkflowValue::map([("kind", WorkflowValue::from("spam"))]))
        .await;
    assert_eq!(other.final_output, Some(WorkflowValue::from("sent to triage")));
}

#[tokio::test]
async fn error_edge_receives_error_record() {
    let workflow = WorkflowBuilder::new("recovering")
        .task("fetch", |_input, _ctx| async {
            Err::<WorkflowValue, _>(NodeError::transient("connection reset"))
        })
        .detach()
        .transform("recover", |input, _| {
            let node = input.get("node").and_then(WorkflowValue::as_str).unwrap_or("?");
            let kind = input.get("kind").and_then(WorkflowValue::as_str).unwrap_or("?");
            Ok(WorkflowValue::from(format!("recovered {node} after {kind}")))
        })
        .on_error("fetch", "recover")
        .start("fetch")
        .build()
        .unwrap();

    let result = workflow.run(WorkflowValue::Null).await;
    assert!(result.is_completed());
    assert_eq!(
        result.final_output,
        Some(WorkflowValue::from("recovered fetch after network"))
    );
    assert_eq!(
        result.outputs.output("fetch").and_then(|r| r.error()).map(|e| e.kind),
        Some(ErrorKind::Network)
    );
}

#[tokio::test]
async fn input_validator_rejects_before_start() {
    let hooks = RecordingHooks::new();
    let workflow = WorkflowBuilder::new("validated")
        .input_validator(Arc::new(MockValidator), json!({ "required": ["query"] }))
        .hooks(Arc::new(hooks.clone()))
        .task("search", echo)
        .build()
        .unwrap();

    let result = workflow
        .run(WorkflowValue::map([("q", WorkflowValue::from("rust"))]))
        .await;
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert!(failure.node.is_none());
    assert!(hooks.started().is_empty());
    assert!(matches!(hooks.events().as_slice(), [HookEvent::Failed(_)]));

    let ok = workflow
        .run(WorkflowValue::map([("query", WorkflowValue::from("rust"))]))
        .await;
    assert!(ok.is_completed());
}

#[tokio::test]
async fn llm_node_renders_prompt_from_prior_outputs() {
    let client = Arc::new(MockLlmClient::new());
    client.add_mock_response("topic: rust", "Rust is a systems language.");

    let workflow = WorkflowBuilder::new("summarize")
        .transform("topic", |input, _| Ok(input))
        .llm(
            "summary",
            client.clone(),
            ModelConfig::new("mock-model").with_temperature(0.0),
            "Summarize topic: {topic}",
        )
        .build()
        .unwrap();

    let result = workflow.run("rust").await;
    assert_eq!(
        result.final_output,
        Some(WorkflowValue::from("Rust is a systems language."))
    );
    assert_eq!(client.call_count(), 1);
    assert_eq!(client.history()[0][0].content, "Summarize topic: rust");
}

#[tokio::test]
async fn provider_auth_failure_is_not_retried() {
    let client = Arc::new(MockLlmClient::new());
    client.fail_next(ProviderError::Auth("bad key".to_string()));

    let workflow = WorkflowBuilder::new("auth")
        .llm("ask", client.clone(), ModelConfig::new("mock-model"), "{input}")
        .with_default_retry("ask")
        .build()
        .unwrap();

    let result = workflow.run("hello").await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::Auth);
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn channel_hooks_stream_the_run() {
    let (hooks, mut rx) = ChannelHooks::channel(64);
    let workflow = WorkflowBuilder::new("observed")
        .hooks(Arc::new(hooks))
        .task("a", echo)
        .task("b", echo)
        .build()
        .unwrap();

    let result = workflow.run("x").await;
    assert!(result.is_completed());

    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    assert_eq!(events.len(), 5);
    assert!(matches!(&events[0], ExecutionEvent::NodeStarted { node, .. } if node == "a"));
    assert!(events.iter().all(|e| e.execution_id() == result.execution_id));
    assert!(events.last().unwrap().is_terminal());
}

#[derive(Default)]
struct MemorySink(Mutex<Vec<Checkpoint>>);

impl CheckpointSink for MemorySink {
    fn checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.0.lock().push(checkpoint.clone());
        Ok(())
    }
}

#[tokio::test]
async fn run_resumes_from_serialized_checkpoint() {
    let sink = Arc::new(MemorySink::default());
    let config = EngineConfig {
        executor: ExecutorConfig {
            checkpoint_interval: 1,
            ..ExecutorConfig::default()
        },
        ..EngineConfig::default()
    };
    let workflow = WorkflowBuilder::new("resumable")
        .config(config)
        .checkpoint_sink(sink.clone())
        .transform("one", |input, _| Ok(WorkflowValue::Int(input.as_i64().unwrap_or(0) + 1)))
        .transform("two", |input, _| Ok(WorkflowValue::Int(input.as_i64().unwrap_or(0) * 10)))
        .transform("three", |input, _| Ok(WorkflowValue::Int(input.as_i64().unwrap_or(0) - 3)))
        .build()
        .unwrap();

    let full = workflow.run(1i64).await;
    assert_eq!(full.final_output, Some(WorkflowValue::Int(17)));

    let first = sink.0.lock().first().cloned().unwrap();
    assert_eq!(first.pending[0].name, "two");
    let stored = serde_json::to_string(&first).unwrap();
    let restored: Checkpoint = serde_json::from_str(&stored).unwrap();

    let resumed = workflow.resume(restored).await;
    assert_eq!(resumed.final_output, Some(WorkflowValue::Int(17)));
    assert_eq!(resumed.execution_id, full.execution_id);
    assert_eq!(resumed.outputs.trace(), ["one", "two", "three"]);
}
