//! A single persona backed by a model.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{
    ChatMessage, CompletionRequest, CompletionResponse, FINISH_CONTENT_FILTER, ModelBackend, tokens,
};
use crate::errors::BackendError;

/// Result of one persona step.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// The completion, absent when the persona was terminated before calling the backend.
    pub response: Option<CompletionResponse>,
    /// The persona cannot continue the dialogue.
    pub terminated: bool,
}

impl AgentReply {
    pub fn content(&self) -> Option<&str> {
        self.response.as_ref().map(|r| r.content.as_str())
    }
}

/// A persona with its own system prompt and dialogue history.
///
/// Incoming messages are stored with the `user` role and the persona's own
/// replies with the `assistant` role, whichever side of the role-play it plays.
pub struct ChatAgent {
    role_name: String,
    system_message: ChatMessage,
    history: Vec<ChatMessage>,
    message_window: Option<usize>,
    backend: Arc<dyn ModelBackend>,
    terminated: bool,
}

impl ChatAgent {
    pub fn new(role_name: &str, system_prompt: &str, backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            role_name: role_name.to_string(),
            system_message: ChatMessage::system(system_prompt),
            history: Vec::new(),
            message_window: None,
            backend,
            terminated: false,
        }
    }

    /// Send only the last `window` history messages with each request.
    pub fn with_message_window(mut self, window: Option<usize>) -> Self {
        self.message_window = window;
        self
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_message.content
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn request_messages(&self) -> Vec<ChatMessage> {
        let start = match self.message_window {
            Some(window) => self.history.len().saturating_sub(window),
            None => 0,
        };
        let mut messages = Vec::with_capacity(self.history.len() - start + 1);
        messages.push(self.system_message.clone());
        messages.extend(self.history[start..].iter().cloned());
        messages
    }

    /// Receive `incoming` and produce one reply.
    pub async fn step(&mut self, incoming: &str) -> Result<AgentReply, BackendError> {
        self.history.push(ChatMessage::user(incoming));

        if self.terminated {
            return Ok(AgentReply {
                response: None,
                terminated: true,
            });
        }

        let messages = self.request_messages();
        let budget = tokens::completion_budget(&messages, self.backend.context_window());
        if budget == 0 {
            warn!(
                role = %self.role_name,
                "Prompt exceeds the context window of {}, terminating persona",
                self.backend.model_name()
            );
            self.terminated = true;
            return Ok(AgentReply {
                response: None,
                terminated: true,
            });
        }

        let response = self.backend.run(CompletionRequest::new(messages)).await?;
        debug!(role = %self.role_name, "{}", response.content);

        if response.finish_reason == FINISH_CONTENT_FILTER {
            warn!(role = %self.role_name, "Completion was filtered, terminating persona");
            self.terminated = true;
        }

        self.history.push(ChatMessage::assistant(response.content.clone()));

        Ok(AgentReply {
            terminated: self.terminated,
            response: Some(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Role, StubBackend};

    #[tokio::test]
    async fn test_step_appends_history() {
        let stub = StubBackend::always("ok");
        let mut agent = ChatAgent::new("Programmer", "You write code.", Arc::new(stub.clone()));

        let reply = agent.step("write hello world").await.unwrap();
        assert_eq!(reply.content(), Some("ok"));
        assert!(!reply.terminated);
        assert_eq!(agent.history().len(), 2);
        assert_eq!(agent.history()[0].role, Role::User);
        assert_eq!(agent.history()[1].role, Role::Assistant);

        let sent = &stub.requests()[0].messages;
        assert_eq!(sent[0], ChatMessage::system("You write code."));
    }

    #[tokio::test]
    async fn test_message_window_bounds_request() {
        let stub = StubBackend::always("ok");
        let mut agent = ChatAgent::new("Programmer", "sys", Arc::new(stub.clone()))
            .with_message_window(Some(1));

        agent.step("one").await.unwrap();
        agent.step("two").await.unwrap();

        let second = &stub.requests()[1].messages;
        // system + the latest incoming message only
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].content, "two");
        assert_eq!(agent.history().len(), 4);
    }

    #[tokio::test]
    async fn test_content_filter_terminates() {
        let stub = StubBackend::always("...").with_finish_reason(FINISH_CONTENT_FILTER);
        let mut agent = ChatAgent::new("Programmer", "sys", Arc::new(stub.clone()));

        let reply = agent.step("hi").await.unwrap();
        assert!(reply.terminated);

        let again = agent.step("hi").await.unwrap();
        assert!(again.response.is_none());
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_terminates_without_call() {
        let stub = StubBackend::always("ok").with_context_window(0);
        let mut agent = ChatAgent::new("Programmer", "sys", Arc::new(stub.clone()));

        let reply = agent.step("hi").await.unwrap();
        assert!(reply.terminated);
        assert!(reply.response.is_none());
        assert_eq!(stub.call_count(), 0);
    }
}
