use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LLMClient, LLMError};

/// Scripted LLM client: responses are served in FIFO order, and requests are
/// recorded so tests can assert on prompts.
#[derive(Debug, Default, Clone)]
pub struct MockLLMClient {
    responses: Arc<Mutex<VecDeque<Result<CompletionResponse, LLMError>>>>,
    by_feature: Arc<Mutex<HashMap<String, VecDeque<Result<CompletionResponse, LLMError>>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    call_count: Arc<AtomicUsize>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, response: Result<CompletionResponse, LLMError>) {
        let mut guard = self.responses.lock().expect("lock responses");
        guard.push_back(response);
    }

    /// Convenience for the common case of a successful text response.
    pub fn enqueue_text(&self, content: impl Into<String>) {
        self.enqueue_response(Ok(text_response(content)));
    }

    /// Queue a response served only to callers with the given feature.
    /// Feature queues win over the shared queue.
    pub fn enqueue_for(&self, feature: &str, response: Result<CompletionResponse, LLMError>) {
        self.by_feature
            .lock()
            .expect("lock feature responses")
            .entry(feature.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn enqueue_text_for(&self, feature: &str, content: impl Into<String>) {
        self.enqueue_for(feature, Ok(text_response(content)));
    }

    /// Returns the number of times `complete` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn recorded_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("lock requests").clone()
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        feature: &str,
    ) -> Result<CompletionResponse, LLMError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("lock requests").push(request);

        if let Some(queued) = self
            .by_feature
            .lock()
            .expect("lock feature responses")
            .get_mut(feature)
            .and_then(|queue| queue.pop_front())
        {
            return queued;
        }

        let mut guard = self.responses.lock().expect("lock responses");
        guard.pop_front().unwrap_or_else(|| {
            Err(LLMError::ProviderError(
                "mock response not provided".to_string(),
            ))
        })
    }
}

fn text_response(content: impl Into<String>) -> CompletionResponse {
    CompletionResponse {
        content: content.into(),
        model: "mock".to_string(),
        input_tokens: 0,
        output_tokens: 0,
        latency_ms: 0,
    }
}
