//! Offline backend for tests and dry runs.
//!
//! Replies come from a responder closure; clones share the call counter and
//! the request log, so a test can hand a clone to the executor and inspect
//! the original afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{BackendSpec, CompletionRequest, CompletionResponse, ModelBackend, tokens};
use crate::errors::BackendError;

/// Reply used when nothing else is scripted.
pub const STUB_REPLY: &str = "Lorem Ipsum";

type Responder = dyn Fn(&CompletionRequest, usize) -> String + Send + Sync;

#[derive(Clone)]
pub struct StubBackend {
    responder: Arc<Responder>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    context_window: u32,
    finish_reason: String,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::always(STUB_REPLY)
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `reply`.
    pub fn always(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::with_responder(move |_, _| reply.clone())
    }

    /// Answer with `replies` in order, repeating the last one once exhausted.
    pub fn scripted(replies: Vec<String>) -> Self {
        Self::with_responder(move |_, index| {
            replies
                .get(index)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or_else(|| STUB_REPLY.to_string())
        })
    }

    /// Answer through `responder`, called with the request and the zero-based call index.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> String + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            context_window: 4096,
            finish_reason: "stop".to_string(),
        }
    }

    pub fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn with_finish_reason(mut self, finish_reason: &str) -> Self {
        self.finish_reason = finish_reason.to_string();
        self
    }

    /// Number of completed `run` calls across all clones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub(crate) fn construct(spec: &BackendSpec) -> Result<Arc<dyn ModelBackend>, BackendError> {
        Ok(Arc::new(
            Self::default().with_context_window(spec.context_window),
        ))
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn run(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let content = (self.responder)(&request, index);

        let prompt_tokens = tokens::estimate_prompt_tokens(&request.messages);
        let completion_tokens = tokens::count_text(&content)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);

        if let Ok(mut log) = self.requests.lock() {
            log.push(request);
        }

        Ok(CompletionResponse {
            content,
            finish_reason: self.finish_reason.clone(),
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;

    #[tokio::test]
    async fn test_default_reply_and_counter() {
        let stub = StubBackend::new();
        let clone = stub.clone();
        let response = clone
            .run(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();

        assert_eq!(response.content, STUB_REPLY);
        assert_eq!(stub.call_count(), 1);
        assert_eq!(stub.requests()[0].messages[0].content, "hi");
    }

    #[tokio::test]
    async fn test_scripted_repeats_last() {
        let stub = StubBackend::scripted(vec!["one".into(), "two".into()]);
        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(stub.run(CompletionRequest::default()).await.unwrap().content);
        }
        assert_eq!(replies, vec!["one", "two", "two"]);
    }
}
