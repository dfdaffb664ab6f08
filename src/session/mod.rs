//! Two-persona role-play sessions.
//!
//! A session pairs an assistant persona (doing the work) with a user persona
//! (directing it). Each turn the assistant answers the latest instruction and
//! the user answers the assistant. The loop stops when the turn limit is
//! reached, when either persona emits the termination marker, or when a persona
//! is terminated by its backend.

mod agent;

pub use agent::{AgentReply, ChatAgent};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{CompletionResponse, ModelBackend};
use crate::env::{SharedEnvironment, TokenUsage, Utterance};
use crate::errors::{ChainError, ChainResult};
use crate::template;

/// Prompt sent to the assistant to critique and revise its own answer.
const REFLECTION_PROMPT: &str = "Review your previous answer critically against the instructions. \
Point out anything missing or wrong, then give the complete revised answer. \
Keep the required output format, including the termination marker if it applies.";

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TurnLimitReached,
    TerminationTokenSeen,
    Error,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::TurnLimitReached => "turn_limit_reached",
            TerminationReason::TerminationTokenSeen => "termination_token_seen",
            TerminationReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// One completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub assistant: Utterance,
    pub user: Utterance,
}

/// Outcome of a role-play session.
#[derive(Debug, Clone)]
pub struct RolePlayResult {
    pub assistant_final_message: String,
    pub user_final_message: String,
    pub transcript: Vec<Exchange>,
    pub terminated_reason: TerminationReason,
}

impl RolePlayResult {
    pub fn turns(&self) -> usize {
        self.transcript.len()
    }
}

/// Outcome of one [`RolePlayingSession::step`].
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Pair { assistant: String, user: String },
    /// A persona stopped; replies produced before that are kept.
    Terminated {
        assistant: Option<String>,
        user: Option<String>,
    },
}

/// Everything needed to set up a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Phase name, used in errors and logs
    pub phase: String,
    pub assistant_role: String,
    pub user_role: String,
    pub assistant_system_prompt: String,
    pub user_system_prompt: String,
    pub termination_marker: String,
    pub message_window: Option<usize>,
}

pub struct RolePlayingSession {
    phase: String,
    assistant: ChatAgent,
    user: ChatAgent,
    marker: String,
}

impl RolePlayingSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn ModelBackend>) -> Self {
        let assistant = ChatAgent::new(
            &config.assistant_role,
            &config.assistant_system_prompt,
            Arc::clone(&backend),
        )
        .with_message_window(config.message_window);
        let user = ChatAgent::new(&config.user_role, &config.user_system_prompt, backend)
            .with_message_window(config.message_window);

        Self {
            phase: config.phase,
            assistant,
            user,
            marker: config.termination_marker,
        }
    }

    pub fn assistant(&self) -> &ChatAgent {
        &self.assistant
    }

    pub fn user(&self) -> &ChatAgent {
        &self.user
    }

    /// Produce the opening instruction from the user persona.
    ///
    /// The filled phase prompt is the first message verbatim; no model call
    /// is made. It is recorded in memory under the user role.
    pub fn init(&mut self, env: &mut SharedEnvironment, initial_prompt: &str) -> String {
        env.record(Utterance::new(self.user.role_name(), initial_prompt, None));
        initial_prompt.to_string()
    }

    fn record_reply(
        env: &mut SharedEnvironment,
        agent: &ChatAgent,
        response: &CompletionResponse,
    ) {
        env.cost.add(agent.model_name(), response);
        env.record(Utterance::new(
            agent.role_name(),
            &response.content,
            Some(TokenUsage {
                prompt_tokens: response.prompt_tokens,
                completion_tokens: response.completion_tokens,
            }),
        ));
    }

    /// Run one turn: assistant reply, optional self-critique, user reply.
    pub async fn step(
        &mut self,
        env: &mut SharedEnvironment,
        incoming: &str,
        is_reflecting: bool,
    ) -> ChainResult<StepOutcome> {
        let reply = self
            .assistant
            .step(incoming)
            .await
            .map_err(|e| ChainError::from_backend(&self.phase, e))?;
        let Some(response) = reply.response else {
            return Ok(StepOutcome::Terminated {
                assistant: None,
                user: None,
            });
        };
        Self::record_reply(env, &self.assistant, &response);
        let mut assistant_content = response.content;

        if reply.terminated {
            return Ok(StepOutcome::Terminated {
                assistant: Some(assistant_content),
                user: None,
            });
        }

        if is_reflecting {
            let revised = self
                .assistant
                .step(REFLECTION_PROMPT)
                .await
                .map_err(|e| ChainError::from_backend(&self.phase, e))?;
            if let Some(response) = revised.response {
                Self::record_reply(env, &self.assistant, &response);
                assistant_content = response.content;
            }
            if revised.terminated {
                return Ok(StepOutcome::Terminated {
                    assistant: Some(assistant_content),
                    user: None,
                });
            }
        }

        let reply = self
            .user
            .step(&assistant_content)
            .await
            .map_err(|e| ChainError::from_backend(&self.phase, e))?;
        let Some(response) = reply.response else {
            return Ok(StepOutcome::Terminated {
                assistant: Some(assistant_content),
                user: None,
            });
        };
        Self::record_reply(env, &self.user, &response);

        if reply.terminated {
            return Ok(StepOutcome::Terminated {
                assistant: Some(assistant_content),
                user: Some(response.content),
            });
        }

        Ok(StepOutcome::Pair {
            assistant: assistant_content,
            user: response.content,
        })
    }

    /// Drive the session to termination.
    pub async fn run(
        &mut self,
        env: &mut SharedEnvironment,
        initial_prompt: &str,
        turn_limit: u32,
        need_reflect: bool,
    ) -> ChainResult<RolePlayResult> {
        let mut incoming = self.init(env, initial_prompt);
        let mut transcript = Vec::new();
        let mut assistant_final = String::new();
        let mut user_final = String::new();
        let mut reason = TerminationReason::TurnLimitReached;

        for turn in 1..=turn_limit {
            debug!(phase = %self.phase, turn, "role-play turn");
            match self.step(env, &incoming, need_reflect).await? {
                StepOutcome::Terminated { assistant, user } => {
                    if let Some(content) = assistant {
                        assistant_final = content;
                    }
                    if let Some(content) = user {
                        user_final = content;
                    }
                    reason = TerminationReason::Error;
                    break;
                }
                StepOutcome::Pair { assistant, user } => {
                    transcript.push(Exchange {
                        assistant: Utterance::new(self.assistant.role_name(), &assistant, None),
                        user: Utterance::new(self.user.role_name(), &user, None),
                    });
                    let done = template::contains_marker(&assistant, &self.marker)
                        || template::contains_marker(&user, &self.marker);
                    assistant_final = assistant;
                    user_final = user.clone();
                    if done {
                        reason = TerminationReason::TerminationTokenSeen;
                        break;
                    }
                    incoming = user;
                }
            }
        }

        info!(
            phase = %self.phase,
            turns = transcript.len(),
            reason = %reason,
            "role-play finished"
        );

        Ok(RolePlayResult {
            assistant_final_message: assistant_final,
            user_final_message: user_final,
            transcript,
            terminated_reason: reason,
        })
    }
}
