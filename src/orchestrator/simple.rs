//! Simple phase: one role-play session plus an extraction rule.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use super::PhaseContext;
use crate::audit::{AuditLogger, CyclePosition, PhaseAudit, PhaseOutcome, TokenUsage};
use crate::env::SharedEnvironment;
use crate::errors::{ChainError, ChainResult};
use crate::phase::PhaseDefinition;
use crate::pipeline::SimplePhaseKind;
use crate::session::{RolePlayResult, RolePlayingSession, SessionConfig};
use crate::template;

/// How long the test command may run before it is considered healthy and stopped.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of the configured test command.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub exist_bugs: bool,
    pub output: String,
}

/// Run `command` through `sh -c` in `dir`.
///
/// A command still running after the timeout is killed and counted as
/// healthy: interactive programs never exit on their own.
pub async fn run_test_command(command: &str, dir: &Path) -> ChainResult<TestReport> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ChainError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

    match timeout(TEST_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => {
            let output = result.map_err(|source| ChainError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exist_bugs = !output.status.success() || stderr.contains("Traceback");
            Ok(TestReport {
                exist_bugs,
                output: format!("{}{}", stdout, stderr).trim().to_string(),
            })
        }
        Err(_) => Ok(TestReport {
            exist_bugs: false,
            output: format!(
                "The software ran for {}s without errors.",
                TEST_TIMEOUT.as_secs()
            ),
        }),
    }
}

/// A registered simple phase bound to its definition.
pub struct SimplePhase<'d> {
    name: String,
    kind: SimplePhaseKind,
    definition: &'d PhaseDefinition,
}

impl<'d> SimplePhase<'d> {
    pub fn new(name: &str, kind: SimplePhaseKind, definition: &'d PhaseDefinition) -> Self {
        Self {
            name: name.to_string(),
            kind,
            definition,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SimplePhaseKind {
        self.kind
    }

    fn role_prompt(&self, ctx: &PhaseContext<'_>, env: &SharedEnvironment, role: &str) -> String {
        let mut values = std::collections::BTreeMap::new();
        values.insert("chatdev_prompt", ctx.config.background_prompt.clone());
        values.insert("task", env.task_prompt().to_string());
        values.insert("assistant_role", self.definition.assistant_role.clone());
        values.insert("user_role", self.definition.user_role.clone());
        template::fill(&ctx.roles.prompt(role), &values)
    }

    fn phase_prompt(&self, env: &SharedEnvironment) -> String {
        let mut values = env.placeholders();
        values.insert("assistant_role", self.definition.assistant_role.clone());
        values.insert("user_role", self.definition.user_role.clone());
        template::fill(&self.definition.prompt_template(), &values)
    }

    /// Environment updates that must happen before the dialogue.
    ///
    /// Composed phases call this ahead of their break check, then run the
    /// dialogue through [`SimplePhase::execute_prepared`].
    pub async fn prepare(&self, ctx: &PhaseContext<'_>, env: &mut SharedEnvironment) -> ChainResult<()> {
        match self.kind {
            SimplePhaseKind::CodeComplete => {
                let next = env.next_unimplemented_file();
                if let Some(file) = &next {
                    *env.completion_attempts.entry(file.clone()).or_insert(0) += 1;
                }
                env.unimplemented_file = next;
            }
            SimplePhaseKind::TestErrorSummary => {
                let report = match &ctx.config.test_command {
                    Some(command) => {
                        env.codebook.write_all(env.artifact_directory())?;
                        run_test_command(command, env.artifact_directory()).await?
                    }
                    None => TestReport {
                        exist_bugs: false,
                        output: "No test command configured.".to_string(),
                    },
                };
                info!(phase = %self.name, exist_bugs = report.exist_bugs, "test run finished");
                env.exist_bugs = report.exist_bugs;
                env.test_reports = report.output;
            }
            _ => {}
        }
        Ok(())
    }

    fn write_artifact(env: &SharedEnvironment, file: &str, content: &str) -> ChainResult<()> {
        let dir = env.artifact_directory();
        std::fs::create_dir_all(dir).map_err(|source| ChainError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(file);
        std::fs::write(&path, content).map_err(|source| ChainError::Io { path, source })
    }

    /// Merge the session outcome into the environment.
    fn apply(
        &self,
        ctx: &PhaseContext<'_>,
        env: &mut SharedEnvironment,
        result: &RolePlayResult,
        record: &mut PhaseAudit,
    ) -> ChainResult<()> {
        let message = &result.assistant_final_message;
        let conclusion = template::conclusion(message, &ctx.config.termination_marker);

        match self.kind {
            SimplePhaseKind::DemandAnalysis => {
                if !conclusion.is_empty() {
                    env.modality = conclusion.trim_end_matches('.').to_lowercase();
                }
            }
            SimplePhaseKind::LanguageChoose => {
                if !conclusion.is_empty() {
                    env.language = conclusion;
                }
            }
            SimplePhaseKind::Brainstorm => env.ideas = conclusion,
            SimplePhaseKind::Coding
            | SimplePhaseKind::CodeComplete
            | SimplePhaseKind::CodeReviewModification
            | SimplePhaseKind::TestModification => {
                let changed = env.codebook.update_from_text(message);
                if changed.is_empty() {
                    warn!(phase = %self.name, "no code blocks found in the final answer");
                } else {
                    env.codebook.write_all(env.artifact_directory())?;
                    let version = env.bump_version();
                    info!(phase = %self.name, version, files = ?changed, "codebook updated");
                    if let Some(tracker) = ctx.tracker {
                        tracker.commit_all(&format!("v{} {}", version, self.name))?;
                        record.file_changes = tracker.last_commit_changes()?;
                    }
                }
            }
            SimplePhaseKind::CodeReviewComment => env.review_comments = conclusion,
            SimplePhaseKind::TestErrorSummary => env.error_summary = conclusion,
            SimplePhaseKind::EnvironmentDoc => {
                let requirements = extract_fenced(message).unwrap_or(conclusion);
                Self::write_artifact(env, "requirements.txt", &format!("{}\n", requirements))?;
                env.requirements = requirements;
            }
            SimplePhaseKind::Manual => {
                Self::write_artifact(env, "manual.md", &format!("{}\n", conclusion))?;
                env.manual = conclusion;
            }
            SimplePhaseKind::Note => env.notes.push(format!("{}: {}", self.name, conclusion)),
        }
        Ok(())
    }

    /// Run the phase to completion and mutate `env` in place.
    ///
    /// Returns the same environment for chaining.
    pub async fn execute<'e>(
        &self,
        ctx: &PhaseContext<'_>,
        env: &'e mut SharedEnvironment,
        audit: &mut AuditLogger,
        turn_limit: u32,
        need_reflect: bool,
        position: Option<CyclePosition>,
    ) -> ChainResult<&'e mut SharedEnvironment> {
        self.execute_inner(ctx, env, audit, turn_limit, need_reflect, position, false)
            .await
    }

    /// Like [`SimplePhase::execute`], for a phase whose `prepare` already ran.
    pub async fn execute_prepared<'e>(
        &self,
        ctx: &PhaseContext<'_>,
        env: &'e mut SharedEnvironment,
        audit: &mut AuditLogger,
        turn_limit: u32,
        need_reflect: bool,
        position: Option<CyclePosition>,
    ) -> ChainResult<&'e mut SharedEnvironment> {
        self.execute_inner(ctx, env, audit, turn_limit, need_reflect, position, true)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_inner<'e>(
        &self,
        ctx: &PhaseContext<'_>,
        env: &'e mut SharedEnvironment,
        audit: &mut AuditLogger,
        turn_limit: u32,
        need_reflect: bool,
        position: Option<CyclePosition>,
        prepared: bool,
    ) -> ChainResult<&'e mut SharedEnvironment> {
        info!(
            phase = %self.name,
            turn_limit,
            need_reflect,
            writes_code = self.kind.writes_code(),
            "phase started"
        );
        let mut record = PhaseAudit::new(&self.name, "simple", position);
        let tokens_before = (env.cost.prompt_tokens, env.cost.completion_tokens);

        let outcome = self
            .run(ctx, env, turn_limit, need_reflect, prepared, &mut record)
            .await;

        record.token_usage = TokenUsage {
            prompt_tokens: env.cost.prompt_tokens - tokens_before.0,
            completion_tokens: env.cost.completion_tokens - tokens_before.1,
        };
        record.version_after = env.version();
        match &outcome {
            Ok(()) => record.finish(PhaseOutcome::Completed),
            Err(e) => record.finish(PhaseOutcome::Error {
                message: e.to_string(),
            }),
        }
        audit.record_phase(record);

        outcome?;
        info!(phase = %self.name, version = env.version(), "phase finished");
        Ok(env)
    }

    async fn run(
        &self,
        ctx: &PhaseContext<'_>,
        env: &mut SharedEnvironment,
        turn_limit: u32,
        need_reflect: bool,
        prepared: bool,
        record: &mut PhaseAudit,
    ) -> ChainResult<()> {
        if !prepared {
            self.prepare(ctx, env).await?;
        }

        let config = SessionConfig {
            phase: self.name.clone(),
            assistant_role: self.definition.assistant_role.clone(),
            user_role: self.definition.user_role.clone(),
            assistant_system_prompt: self.role_prompt(ctx, env, &self.definition.assistant_role),
            user_system_prompt: self.role_prompt(ctx, env, &self.definition.user_role),
            termination_marker: ctx.config.termination_marker.clone(),
            message_window: ctx.message_window,
        };
        let prompt = self.phase_prompt(env);

        let mut session = RolePlayingSession::new(config, Arc::clone(&ctx.backend));
        let result = session.run(env, &prompt, turn_limit, need_reflect).await?;

        record.turns = u32::try_from(result.turns()).unwrap_or(u32::MAX);
        record.terminated_reason = Some(result.terminated_reason);

        self.apply(ctx, env, &result, record)
    }
}

/// Body of the first fenced block in `text`.
fn extract_fenced(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    let content = body[..end].trim();
    (!content.is_empty()).then(|| content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ModelBackend, StubBackend};
    use crate::chain_config::ChainConfig;
    use crate::orchestrator::CancelFlag;
    use crate::phase::{PhaseBook, RoleBook};
    use crate::pipeline::{CompositionGraphBuilder, PhaseRegistry};
    use crate::session::TerminationReason;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct Fixture {
        config: ChainConfig,
        phases: PhaseBook,
        roles: RoleBook,
        registry: PhaseRegistry,
        graph: crate::pipeline::CompositionGraph,
        cancel: CancelFlag,
    }

    impl Fixture {
        fn new() -> Self {
            let config = ChainConfig {
                background_prompt: "ChatDev is a software company.".into(),
                ..ChainConfig::default()
            };
            let mut roles = RoleBook::default();
            roles.insert("Programmer", "{chatdev_prompt}\nYou are {assistant_role} working on {task}.");
            roles.insert("Chief Technology Officer", "{chatdev_prompt}\nYou are the CTO.");
            let graph = CompositionGraphBuilder::new(&[], &BTreeMap::new()).build().unwrap();
            Self {
                config,
                phases: PhaseBook::default(),
                roles,
                registry: PhaseRegistry::chatdev(),
                graph,
                cancel: CancelFlag::new(),
            }
        }

        fn ctx(&self, backend: Arc<dyn ModelBackend>) -> PhaseContext<'_> {
            PhaseContext {
                config: &self.config,
                phases: &self.phases,
                roles: &self.roles,
                registry: &self.registry,
                graph: &self.graph,
                backend,
                tracker: None,
                cancel: &self.cancel,
                message_window: None,
            }
        }
    }

    fn definition(prompt: &str) -> PhaseDefinition {
        PhaseDefinition::new("Programmer", "Chief Technology Officer", prompt)
    }

    #[tokio::test]
    async fn test_language_choose_extracts_conclusion() {
        let fixture = Fixture::new();
        let stub = StubBackend::always("We agree. <INFO> Python");
        let ctx = fixture.ctx(Arc::new(stub.clone()));
        let dir = tempdir().unwrap();
        let mut env = SharedEnvironment::new("a snake game", dir.path());
        let mut audit = AuditLogger::new(dir.path());
        audit.start_run(Default::default()).unwrap();

        let def = definition("Pick a language for {task}.");
        let phase = SimplePhase::new("LanguageChoose", SimplePhaseKind::LanguageChoose, &def);
        phase
            .execute(&ctx, &mut env, &mut audit, 3, false, None)
            .await
            .unwrap();

        assert_eq!(env.language, "Python");
        let first = &stub.requests()[0].messages;
        assert!(first[0].content.contains("ChatDev is a software company."));
        assert!(first[0].content.contains("working on a snake game"));
        assert_eq!(first[1].content, "Pick a language for a snake game.");

        let run = audit.current_run().unwrap();
        assert_eq!(run.phases[0].turns, 1);
        assert_eq!(
            run.phases[0].terminated_reason,
            Some(TerminationReason::TerminationTokenSeen)
        );
    }

    #[tokio::test]
    async fn test_coding_writes_files_and_bumps_version() {
        let fixture = Fixture::new();
        let reply = "main.py\n```python\nprint('snake')\n```\n<INFO> Finished";
        let ctx = fixture.ctx(Arc::new(StubBackend::always(reply)));
        let dir = tempdir().unwrap();
        let mut env = SharedEnvironment::new("a snake game", dir.path());
        let mut audit = AuditLogger::new(dir.path());
        audit.start_run(Default::default()).unwrap();

        let def = definition("Write the code.");
        let phase = SimplePhase::new("Coding", SimplePhaseKind::Coding, &def);
        let env = phase
            .execute(&ctx, &mut env, &mut audit, 1, false, None)
            .await
            .unwrap();

        assert_eq!(env.version(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("main.py")).unwrap(),
            "print('snake')\n"
        );
        assert_eq!(audit.current_run().unwrap().phases[0].version_after, 1);
    }

    #[tokio::test]
    async fn test_manual_and_environment_doc_write_files() {
        let fixture = Fixture::new();
        let dir = tempdir().unwrap();
        let mut env = SharedEnvironment::new("a snake game", dir.path());
        let mut audit = AuditLogger::new(dir.path());
        audit.start_run(Default::default()).unwrap();
        let def = definition("Document it.");

        let ctx = fixture.ctx(Arc::new(StubBackend::always(
            "requirements.txt\n```\npygame==2.5.0\n```\n<INFO>",
        )));
        SimplePhase::new("EnvironmentDoc", SimplePhaseKind::EnvironmentDoc, &def)
            .execute(&ctx, &mut env, &mut audit, 1, false, None)
            .await
            .unwrap();
        assert_eq!(env.requirements, "pygame==2.5.0");

        let ctx = fixture.ctx(Arc::new(StubBackend::always("<INFO> # Snake\nRun main.py")));
        SimplePhase::new("Manual", SimplePhaseKind::Manual, &def)
            .execute(&ctx, &mut env, &mut audit, 1, false, None)
            .await
            .unwrap();
        let manual = std::fs::read_to_string(dir.path().join("manual.md")).unwrap();
        assert!(manual.starts_with("# Snake"));
    }

    #[tokio::test]
    async fn test_test_error_summary_runs_command() {
        let mut fixture = Fixture::new();
        fixture.config.test_command = Some("echo 'Traceback: boom' >&2; exit 1".into());
        let ctx = fixture.ctx(Arc::new(StubBackend::always("<INFO> fix the import")));
        let dir = tempdir().unwrap();
        let mut env = SharedEnvironment::new("a snake game", dir.path());
        let mut audit = AuditLogger::new(dir.path());
        audit.start_run(Default::default()).unwrap();

        let def = definition("Summarize: {test_reports}");
        SimplePhase::new("TestErrorSummary", SimplePhaseKind::TestErrorSummary, &def)
            .execute(&ctx, &mut env, &mut audit, 1, false, None)
            .await
            .unwrap();

        assert!(env.exist_bugs);
        assert!(env.test_reports.contains("Traceback: boom"));
        assert_eq!(env.error_summary, "fix the import");
    }

    #[tokio::test]
    async fn test_run_test_command_success() {
        let dir = tempdir().unwrap();
        let report = run_test_command("echo ok", dir.path()).await.unwrap();
        assert!(!report.exist_bugs);
        assert_eq!(report.output, "ok");
    }

    #[test]
    fn test_extract_fenced() {
        assert_eq!(
            extract_fenced("deps:\n```text\nnumpy\npygame\n```"),
            Some("numpy\npygame".to_string())
        );
        assert_eq!(extract_fenced("no fence"), None);
    }
}
