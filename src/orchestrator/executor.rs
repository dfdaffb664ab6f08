//! The chain executor: runs a validated pipeline against one shared environment.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{error, info, warn};

use super::hooks::{HookContext, LifecycleHooks, NoopHooks};
use super::{CancelFlag, ComposedPhase, PhaseContext, SimplePhase};
use crate::audit::{AuditLogger, CyclePosition, RunConfig};
use crate::backend::ModelBackend;
use crate::chain_config::ChainConfig;
use crate::env::{CostAccumulator, SharedEnvironment};
use crate::errors::{ChainError, ChainResult};
use crate::phase::{PhaseBook, PhaseStep, PhaseType, RoleBook};
use crate::pipeline::{PhaseRegistry, ValidatedPipeline};
use crate::tracker::GitTracker;

/// Bind a simple step to its definition, handler kind, turn limit and reflection flag.
fn simple_phase<'a>(
    ctx: &'a PhaseContext<'a>,
    step: &'a PhaseStep,
) -> ChainResult<(SimplePhase<'a>, u32, bool)> {
    let not_implemented = || ChainError::PhaseNotImplemented {
        phase: step.phase.clone(),
        kind: "simple",
    };
    let definition = ctx.phases.get(&step.phase).ok_or_else(not_implemented)?;
    let kind = ctx.registry.simple(&step.phase).ok_or_else(not_implemented)?;
    let turn_limit = step.turn_limit(definition, ctx.config.default_turn_limit);
    let need_reflect = step.need_reflect || definition.needs_reflection;
    Ok((SimplePhase::new(&step.phase, kind, definition), turn_limit, need_reflect))
}

/// Run the pre-dialogue environment updates of a simple step.
///
/// Returns whether anything was prepared; composed steps have nothing to do.
pub(crate) async fn prepare_step(
    ctx: &PhaseContext<'_>,
    env: &mut SharedEnvironment,
    step: &PhaseStep,
) -> ChainResult<bool> {
    ctx.cancel.check(&step.phase)?;
    if !matches!(step.phase_type, PhaseType::Simple) {
        return Ok(false);
    }
    let (phase, _, _) = simple_phase(ctx, step)?;
    phase.prepare(ctx, env).await?;
    Ok(true)
}

/// Execute one pipeline step, simple or composed.
///
/// Cancellation is checked here, so it applies to top-level steps and to
/// every child of a composed phase alike. `prepared` skips the pre-dialogue
/// updates already applied by [`prepare_step`].
pub(crate) fn run_step<'a>(
    ctx: &'a PhaseContext<'a>,
    env: &'a mut SharedEnvironment,
    audit: &'a mut AuditLogger,
    step: &'a PhaseStep,
    position: Option<CyclePosition>,
    prepared: bool,
) -> BoxFuture<'a, ChainResult<()>> {
    Box::pin(async move {
        ctx.cancel.check(&step.phase)?;

        match &step.phase_type {
            PhaseType::Simple => {
                let (phase, turn_limit, need_reflect) = simple_phase(ctx, step)?;
                if prepared {
                    phase
                        .execute_prepared(ctx, env, audit, turn_limit, need_reflect, position)
                        .await?;
                } else {
                    phase
                        .execute(ctx, env, audit, turn_limit, need_reflect, position)
                        .await?;
                }
                Ok(())
            }
            PhaseType::Composed => {
                let definition = ctx.graph.definition(&step.phase).ok_or_else(|| {
                    ChainError::Configuration(format!(
                        "Composed phase '{}' has no definition",
                        step.phase
                    ))
                })?;
                let kind = ctx.registry.composed(&step.phase).ok_or_else(|| {
                    ChainError::PhaseNotImplemented {
                        phase: step.phase.clone(),
                        kind: "composed",
                    }
                })?;

                let phase = ComposedPhase::new(&step.phase, kind, definition);
                phase.execute(ctx, env, audit, position).await
            }
            PhaseType::Unknown(raw) => Err(ChainError::UnknownPhaseType {
                phase: step.phase.clone(),
                phase_type: raw.clone(),
            }),
        }
    })
}

/// Audit persistence failures are logged and never decide the outcome of a run.
fn warn_audit<T>(result: anyhow::Result<T>) -> Option<T> {
    result
        .map_err(|e| warn!("Audit record not saved: {:#}", e))
        .ok()
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub artifact_directory: PathBuf,
    pub version: u32,
    pub cost: CostAccumulator,
    pub phases_recorded: usize,
    /// `audit.json`, when the artifact directory exists
    pub audit_file: Option<PathBuf>,
}

/// Owns the configuration, the environment and the audit record of one run.
pub struct ChainExecutor {
    config: ChainConfig,
    phases: PhaseBook,
    roles: RoleBook,
    registry: PhaseRegistry,
    pipeline: ValidatedPipeline,
    backend: Arc<dyn ModelBackend>,
    hooks: Box<dyn LifecycleHooks>,
    cancel: CancelFlag,
    message_window: Option<usize>,
    run_config: RunConfig,
    env: SharedEnvironment,
    audit: AuditLogger,
    tracker: Option<GitTracker>,
}

impl ChainExecutor {
    /// Validate the pipeline and build an executor.
    ///
    /// Fails before any backend call on unknown phase types, unregistered
    /// phases and cyclic compositions.
    pub fn new(
        config: ChainConfig,
        phases: PhaseBook,
        roles: RoleBook,
        registry: PhaseRegistry,
        backend: Arc<dyn ModelBackend>,
    ) -> ChainResult<Self> {
        let pipeline = ValidatedPipeline::validate(&config, &phases, &registry)?;
        for warning in config.warnings() {
            warn!("{}", warning);
        }

        let mut env = SharedEnvironment::default();
        env.gui_design = config.gui_design;

        Ok(Self {
            config,
            phases,
            roles,
            registry,
            pipeline,
            backend,
            hooks: Box::new(NoopHooks),
            cancel: CancelFlag::new(),
            message_window: None,
            run_config: RunConfig::default(),
            env,
            audit: AuditLogger::detached(),
            tracker: None,
        })
    }

    pub fn with_hooks(mut self, hooks: impl LifecycleHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Bound the dialogue history each persona sends per request.
    pub fn with_message_window(mut self, window: Option<usize>) -> Self {
        self.message_window = window;
        self
    }

    pub fn with_run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }

    /// Start from a prepared environment instead of an empty one.
    pub fn with_environment(mut self, mut env: SharedEnvironment) -> Self {
        env.gui_design = env.gui_design || self.config.gui_design;
        self.env = env;
        self
    }

    pub fn env(&self) -> &SharedEnvironment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut SharedEnvironment {
        &mut self.env
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn pipeline(&self) -> &ValidatedPipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Register the configured personas with the environment.
    pub fn make_recruitment(&mut self) {
        for name in &self.config.recruitments {
            self.env.recruit(name);
        }
    }

    /// Split `self` into the shared phase context and the mutable run state.
    fn parts(&mut self) -> (PhaseContext<'_>, &mut SharedEnvironment, &mut AuditLogger, &[PhaseStep]) {
        let Self {
            config,
            phases,
            roles,
            registry,
            pipeline,
            backend,
            cancel,
            message_window,
            env,
            audit,
            tracker,
            ..
        } = self;

        let ctx = PhaseContext {
            config,
            phases,
            roles,
            registry,
            graph: &pipeline.graph,
            backend: Arc::clone(backend),
            tracker: tracker.as_ref(),
            cancel,
            message_window: *message_window,
        };
        (ctx, env, audit, pipeline.steps.as_slice())
    }

    fn ensure_audit_run(&mut self) -> ChainResult<()> {
        if self.audit.current_run().is_none() {
            self.audit.start_run(self.run_config.clone())?;
        }
        Ok(())
    }

    /// Run a single step against the environment.
    pub async fn execute_step(&mut self, step: &PhaseStep) -> ChainResult<()> {
        self.ensure_audit_run()?;
        let (ctx, env, audit, _) = self.parts();
        run_step(&ctx, env, audit, step, None, false).await
    }

    /// Run every top-level step in declared order. The first error stops the chain.
    pub async fn execute_chain(&mut self) -> ChainResult<()> {
        self.ensure_audit_run()?;
        let (ctx, env, audit, steps) = self.parts();
        for step in steps {
            run_step(&ctx, &mut *env, &mut *audit, step, None, false).await?;
        }
        Ok(())
    }

    /// Full run: pre-processing hook, recruitment, chain, post-processing hook.
    ///
    /// Post-processing runs whenever pre-processing succeeded, also after a
    /// failed or cancelled chain. The chain error takes precedence over a
    /// post-processing error.
    pub async fn run(&mut self) -> ChainResult<RunSummary> {
        self.audit.start_run(self.run_config.clone())?;

        let pre = {
            let hook_ctx = HookContext {
                config: &self.config,
                roles: &self.roles,
                backend: Arc::clone(&self.backend),
                tracker: None,
            };
            self.hooks.pre_run(&hook_ctx, &mut self.env).await
        };
        if let Err(e) = pre {
            error!("Pre-processing failed: {}", e);
            warn_audit(self.audit.record_error(&e.to_string()));
            return Err(e);
        }

        let artifact_dir = self.env.artifact_directory().to_path_buf();
        if artifact_dir.is_dir() {
            warn_audit(self.audit.relocate(&artifact_dir));
        }

        let chain_result = match self.start_tracking(&artifact_dir) {
            Ok(()) => {
                self.make_recruitment();
                info!(
                    steps = self.pipeline.steps.len(),
                    planned = self.pipeline.planned_executions(),
                    "Chain started"
                );
                self.execute_chain().await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &chain_result {
            error!(kind = e.kind(), "Chain stopped: {}", e);
            warn_audit(self.audit.record_error(&e.to_string()));
        }

        let post = {
            let hook_ctx = HookContext {
                config: &self.config,
                roles: &self.roles,
                backend: Arc::clone(&self.backend),
                tracker: self.tracker.as_ref(),
            };
            self.hooks
                .post_run(&hook_ctx, &mut self.env, chain_result.as_ref().err())
                .await
        };

        let audit_file = warn_audit(self.audit.finish_run());
        if let (Err(_), Err(post_err)) = (&chain_result, &post) {
            warn!("Post-processing also failed: {}", post_err);
        }
        chain_result?;
        post?;

        let run = self.audit.current_run();
        Ok(RunSummary {
            artifact_directory: artifact_dir,
            version: self.env.version(),
            cost: self.env.cost.clone(),
            phases_recorded: run.map(|r| r.phases.len()).unwrap_or(0),
            audit_file: audit_file.filter(|file| file.is_file()),
        })
    }

    fn start_tracking(&mut self, artifact_dir: &std::path::Path) -> ChainResult<()> {
        if !self.config.git_management {
            return Ok(());
        }
        std::fs::create_dir_all(artifact_dir).map_err(|source| ChainError::Io {
            path: artifact_dir.to_path_buf(),
            source,
        })?;
        self.tracker = Some(GitTracker::init(artifact_dir)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::PhaseOutcome;
    use crate::backend::StubBackend;
    use crate::phase::PhaseDefinition;
    use crate::pipeline::SimplePhaseKind;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn book(names: &[&str]) -> PhaseBook {
        let mut book = PhaseBook::default();
        for name in names {
            book.insert(name, PhaseDefinition::new("Programmer", "Chief Executive Officer", "Do {task}."));
        }
        book
    }

    fn registry(names: &[&str]) -> PhaseRegistry {
        let mut registry = PhaseRegistry::new();
        for name in names {
            registry.register_simple(name, SimplePhaseKind::Note);
        }
        registry
    }

    fn executor(chain: Vec<PhaseStep>, stub: &StubBackend, dir: &std::path::Path) -> ChainExecutor {
        let config = ChainConfig {
            chain,
            recruitments: vec!["Programmer".into()],
            ..ChainConfig::default()
        };
        ChainExecutor::new(
            config,
            book(&["Spec", "Code"]),
            RoleBook::default(),
            registry(&["Spec", "Code"]),
            Arc::new(stub.clone()),
        )
        .unwrap()
        .with_environment(SharedEnvironment::new("build", dir))
    }

    #[tokio::test]
    async fn test_run_executes_chain_in_order() {
        let dir = tempdir().unwrap();
        let stub = StubBackend::always("<INFO> ok");
        let mut exec = executor(
            vec![PhaseStep::simple("Spec", 3, false), PhaseStep::simple("Code", 3, false)],
            &stub,
            dir.path(),
        );

        let summary = exec.run().await.unwrap();
        assert_eq!(summary.phases_recorded, 2);
        assert_eq!(stub.call_count(), 4);
        assert!(exec.env().is_recruited("Programmer"));
        assert_eq!(exec.env().notes, vec!["Spec: ok", "Code: ok"]);
        assert_eq!(summary.audit_file, Some(dir.path().join("audit.json")));
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_phase() {
        let dir = tempdir().unwrap();
        let stub = StubBackend::always("<INFO> ok");
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut exec = executor(vec![PhaseStep::simple("Spec", 1, false)], &stub, dir.path())
            .with_cancel_flag(cancel);

        let err = exec.run().await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(stub.call_count(), 0);
        assert!(exec.audit().current_run().unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_composed_children_recorded_with_cycle() {
        let dir = tempdir().unwrap();
        let stub = StubBackend::always("still going");
        let mut registry = registry(&["Spec", "Code"]);
        registry.register_composed("Loop", crate::pipeline::ComposedPhaseKind::Cycle);
        let config = ChainConfig {
            chain: vec![PhaseStep::composed("Loop", 2, vec![PhaseStep::simple("Code", 1, false)])],
            ..ChainConfig::default()
        };
        let mut exec = ChainExecutor::new(config, book(&["Code"]), RoleBook::default(), registry, Arc::new(stub.clone()))
            .unwrap()
            .with_environment(SharedEnvironment::new("build", dir.path()));

        exec.run().await.unwrap();
        let run = exec.audit().current_run().unwrap();
        let cycles: Vec<u32> = run
            .phases
            .iter()
            .filter_map(|p| p.position.as_ref().map(|pos| pos.cycle))
            .collect();
        assert_eq!(cycles, vec![0, 1]);
        assert_eq!(run.phases.last().unwrap().phase, "Loop");
        assert_eq!(run.phases.last().unwrap().outcome, PhaseOutcome::Completed);
    }

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LifecycleHooks for Arc<RecordingHooks> {
        async fn pre_run(&self, _ctx: &HookContext<'_>, _env: &mut SharedEnvironment) -> ChainResult<()> {
            self.calls.lock().unwrap().push("pre".into());
            Ok(())
        }

        async fn post_run(
            &self,
            _ctx: &HookContext<'_>,
            _env: &mut SharedEnvironment,
            failure: Option<&ChainError>,
        ) -> ChainResult<()> {
            let entry = match failure {
                Some(e) => format!("post:{}", e.kind()),
                None => "post".to_string(),
            };
            self.calls.lock().unwrap().push(entry);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_post_run_when_audit_cannot_be_written() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("audit.json")).unwrap();
        let stub = StubBackend::always("<INFO> ok");
        let hooks = Arc::new(RecordingHooks::default());
        let mut exec = executor(vec![PhaseStep::simple("Spec", 1, false)], &stub, dir.path())
            .with_hooks(Arc::clone(&hooks));

        let summary = exec.run().await.unwrap();
        assert_eq!(*hooks.calls.lock().unwrap(), vec!["pre", "post"]);
        assert_eq!(summary.phases_recorded, 1);
        assert_eq!(summary.audit_file, None);
    }

    #[tokio::test]
    async fn test_post_run_after_failure() {
        let dir = tempdir().unwrap();
        let stub = StubBackend::always("ok");
        let hooks = Arc::new(RecordingHooks::default());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut exec = executor(vec![PhaseStep::simple("Spec", 1, false)], &stub, dir.path())
            .with_hooks(Arc::clone(&hooks))
            .with_cancel_flag(cancel);

        assert!(exec.run().await.is_err());
        assert_eq!(*hooks.calls.lock().unwrap(), vec!["pre", "post:cancelled"]);
    }
}
