use async_trait::async_trait;
use loomflow_kernel::workflow::{ChatMessage, LlmClient, ModelConfig, ProviderError, WorkflowValue};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A mock backend that implements `LlmClient`.
/// It allows developers to specify predefined responses for specific prompts,
/// enabling deterministic testing of workflows without hitting real APIs.
#[derive(Clone)]
pub struct MockLlmClient {
    /// Maps a prompt substring to a predefined response string
    predefined_responses: Arc<RwLock<HashMap<String, String>>>,
    /// Errors returned, in order, before any response
    queued_failures: Arc<RwLock<VecDeque<ProviderError>>>,
    /// Every message list received
    call_history: Arc<RwLock<Vec<Vec<ChatMessage>>>>,
    /// Fallback response if no predefined prompt matches
    fallback_response: String,
    latency: Option<Duration>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            predefined_responses: Arc::new(RwLock::new(HashMap::new())),
            queued_failures: Arc::new(RwLock::new(VecDeque::new())),
            call_history: Arc::new(RwLock::new(Vec::new())),
            fallback_response: "This is a fallback mock response.".to_string(),
            latency: None,
        }
    }

    /// Add a predefined response for a given prompt substring.
    /// If the last user message contains `prompt_key`, it will return `response`.
    pub fn add_mock_response(&self, prompt_key: &str, response: &str) {
        if let Ok(mut resps) = self.predefined_responses.write() {
            resps.insert(prompt_key.to_string(), response.to_string());
        }
    }

    /// Set the fallback response for when no predefined response matches the prompt.
    pub fn set_fallback_response(&mut self, response: &str) {
        self.fallback_response = response.to_string();
    }

    /// Fail the next call with `error`. Queued failures are consumed first.
    pub fn fail_next(&self, error: ProviderError) {
        if let Ok(mut queue) = self.queued_failures.write() {
            queue.push_back(error);
        }
    }

    /// Sleep this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn history(&self) -> Vec<Vec<ChatMessage>> {
        self.call_history
            .read()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.call_history.read().map(|h| h.len()).unwrap_or(0)
    }

    fn respond(&self, prompt: &str) -> String {
        if let Ok(resps) = self.predefined_responses.read() {
            for (k, v) in resps.iter() {
                if prompt.contains(k.as_str()) {
                    return v.clone();
                }
            }
        }
        self.fallback_response.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _config: &ModelConfig,
    ) -> Result<WorkflowValue, ProviderError> {
        if let Ok(mut history) = self.call_history.write() {
            history.push(messages.to_vec());
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let queued = self
            .queued_failures
            .write()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        if let Some(error) = queued {
            return Err(error);
        }

        let prompt = messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(WorkflowValue::from(self.respond(prompt)))
    }
}
