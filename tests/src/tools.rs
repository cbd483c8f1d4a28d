use async_trait::async_trait;
use loomflow_kernel::workflow::{
    ArgumentValidator, ToolError, ToolExecutor, ValidationError, WorkflowValue,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A mock tool simulating a real tool runtime
///
/// It allows developers to specify predefined execution outcomes
/// and track arguments that were passed to it during execution.
#[derive(Clone)]
pub struct MockTool {
    name: String,
    /// Outcome once the queue is empty
    pub stubbed_result: Arc<RwLock<Result<WorkflowValue, ToolError>>>,
    /// One-shot outcomes, consumed in order
    pub queued_results: Arc<RwLock<VecDeque<Result<WorkflowValue, ToolError>>>>,
    /// Track all arguments passed to this tool
    pub call_history: Arc<RwLock<Vec<WorkflowValue>>>,
}

impl MockTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stubbed_result: Arc::new(RwLock::new(Ok(WorkflowValue::from(
                "Mock Execution Default",
            )))),
            queued_results: Arc::new(RwLock::new(VecDeque::new())),
            call_history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Sets the result this tool will produce when executed.
    pub async fn set_result(&self, result: Result<WorkflowValue, ToolError>) {
        *self.stubbed_result.write().await = result;
    }

    /// Queue a result for the next call only.
    pub async fn push_result(&self, result: Result<WorkflowValue, ToolError>) {
        self.queued_results.write().await.push_back(result);
    }

    /// Retrieve the history of calls made to this tool
    pub async fn history(&self) -> Vec<WorkflowValue> {
        self.call_history.read().await.clone()
    }

    /// Check the total number of times this tool was executed
    pub async fn call_count(&self) -> usize {
        self.call_history.read().await.len()
    }
}

#[async_trait]
impl ToolExecutor for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, args: WorkflowValue) -> Result<WorkflowValue, ToolError> {
        self.call_history.write().await.push(args);
        if let Some(result) = self.queued_results.write().await.pop_front() {
            return result;
        }
        self.stubbed_result.read().await.clone()
    }
}

/// Checks that every field listed under the schema's `required` array is
/// present in a map argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockValidator;

impl ArgumentValidator for MockValidator {
    fn validate(
        &self,
        raw: &WorkflowValue,
        schema: &serde_json::Value,
    ) -> Result<WorkflowValue, ValidationError> {
        let Some(fields) = raw.as_map() else {
            return Err(ValidationError::new("arguments must be an object"));
        };
        let required = schema
            .get("required")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        for field in required.iter().filter_map(serde_json::Value::as_str) {
            if !fields.contains_key(field) {
                return Err(ValidationError::at(field, "required field is missing"));
            }
        }
        Ok(raw.clone())
    }
}

#[macro_export]
macro_rules! assert_tool_called {
    ($tool:expr, $expected_count:expr) => {
        let count = $tool.call_count().await;
        assert_eq!(
            count,
            $expected_count,
            "Expected tool '{}' to be called {} times, but was called {} times",
            $tool.name(),
            $expected_count,
            count
        );
    };
}
