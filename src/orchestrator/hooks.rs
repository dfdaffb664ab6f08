//! Lifecycle hooks run once before the first phase and once after the last.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::backend::ModelBackend;
use crate::chain_config::ChainConfig;
use crate::config;
use crate::env::{Codebook, SharedEnvironment, Utterance};
use crate::errors::{ChainError, ChainResult};
use crate::phase::RoleBook;
use crate::session::ChatAgent;
use crate::template;
use crate::tracker::GitTracker;

const PROMPT_ENGINEER: &str = "Prompt Engineer";

const SELF_IMPROVE_PROMPT: &str = "I will give you a short description of a software design requirement. \
Please rewrite it into a detailed prompt that makes a large language model understand how to build \
the software better: describe the expected features, the user interface and the behaviour precisely. \
Keep the rewritten prompt under 200 words. \
Answer in the format \"<INFO> REVISED_PROMPT\".\nThe requirement is: \"{task}\"";

/// Read-only view lent to hooks.
pub struct HookContext<'a> {
    pub config: &'a ChainConfig,
    pub roles: &'a RoleBook,
    pub backend: Arc<dyn ModelBackend>,
    /// Present after staging when git management is enabled
    pub tracker: Option<&'a GitTracker>,
}

#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn pre_run(&self, ctx: &HookContext<'_>, env: &mut SharedEnvironment) -> ChainResult<()>;

    /// Runs whenever `pre_run` succeeded; `failure` is the error that stopped the chain.
    async fn post_run(
        &self,
        ctx: &HookContext<'_>,
        env: &mut SharedEnvironment,
        failure: Option<&ChainError>,
    ) -> ChainResult<()>;
}

/// Hooks that touch nothing. The environment is used as given.
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {
    async fn pre_run(&self, _ctx: &HookContext<'_>, _env: &mut SharedEnvironment) -> ChainResult<()> {
        Ok(())
    }

    async fn post_run(
        &self,
        _ctx: &HookContext<'_>,
        _env: &mut SharedEnvironment,
        _failure: Option<&ChainError>,
    ) -> ChainResult<()> {
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ChainError + '_ {
    move |source| ChainError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Stages a run directory under the warehouse and finalizes it afterwards.
///
/// Layout: `<warehouse>/<project>_<org>_<timestamp>/` receives the config
/// files, the prompt, generated code, `meta.txt`, the audit record and the
/// run log.
#[derive(Debug, Clone)]
pub struct WarehouseStaging {
    warehouse: PathBuf,
    project_name: String,
    org_name: String,
    start_time: String,
    task_prompt: String,
    config_dir: PathBuf,
    config_files: Vec<PathBuf>,
    code_path: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

impl WarehouseStaging {
    pub fn new(warehouse: &Path, project_name: &str, org_name: &str, task_prompt: &str) -> Self {
        Self {
            warehouse: warehouse.to_path_buf(),
            project_name: project_name.to_string(),
            org_name: org_name.to_string(),
            start_time: config::timestamp(),
            task_prompt: task_prompt.to_string(),
            config_dir: PathBuf::new(),
            config_files: Vec::new(),
            code_path: None,
            log_file: None,
        }
    }

    pub fn with_start_time(mut self, start_time: &str) -> Self {
        self.start_time = start_time.to_string();
        self
    }

    /// Config files copied into the artifact directory.
    pub fn with_config_files(mut self, config_dir: &Path, files: &[&Path]) -> Self {
        self.config_dir = config_dir.to_path_buf();
        self.config_files = files.iter().map(|f| f.to_path_buf()).collect();
        self
    }

    /// Existing code base for incremental development.
    pub fn with_code_path(mut self, code_path: Option<PathBuf>) -> Self {
        self.code_path = code_path;
        self
    }

    /// Run log moved into the artifact directory when the run ends.
    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        self.log_file = log_file;
        self
    }

    pub fn artifact_directory(&self) -> PathBuf {
        self.warehouse.join(config::software_name(
            &self.project_name,
            &self.org_name,
            &self.start_time,
        ))
    }

    /// Remove loose files left in the warehouse by earlier runs. Run logs stay.
    fn clear_warehouse(&self) -> ChainResult<()> {
        if !self.warehouse.is_dir() {
            return Ok(());
        }
        let entries = fs::read_dir(&self.warehouse).map_err(io_error(&self.warehouse))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_log = path.extension().is_some_and(|ext| ext == "log");
            if path.is_file() && !is_log {
                fs::remove_file(&path).map_err(io_error(&path))?;
                info!("Removed stale warehouse file {}", path.display());
            }
        }
        Ok(())
    }

    fn copy_configs(&self, artifact_dir: &Path) -> ChainResult<()> {
        for file in &self.config_files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = artifact_dir.join(name);
            fs::copy(file, &target).map_err(io_error(file))?;
        }
        Ok(())
    }

    /// Copy the existing code base into `base/` and load it into the codebook.
    fn stage_code_base(&self, code_path: &Path, env: &mut SharedEnvironment) -> ChainResult<()> {
        let base = env.artifact_directory().join("base");
        for entry in WalkDir::new(code_path).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(code_path) else {
                continue;
            };
            let target = base.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::copy(entry.path(), &target).map_err(io_error(entry.path()))?;
        }
        env.codebook = Codebook::load_from_dir(code_path)?;
        info!(
            files = env.codebook.len(),
            "Loaded existing code base from {}",
            code_path.display()
        );
        Ok(())
    }

    /// Rewrite the task through one Prompt Engineer reply.
    async fn improve_task(&self, ctx: &HookContext<'_>, env: &mut SharedEnvironment) -> ChainResult<String> {
        let mut values = std::collections::BTreeMap::new();
        values.insert("chatdev_prompt", ctx.config.background_prompt.clone());
        values.insert("task", self.task_prompt.clone());
        values.insert("assistant_role", PROMPT_ENGINEER.to_string());
        values.insert("user_role", "User".to_string());

        let system_prompt = template::fill(&ctx.roles.prompt(PROMPT_ENGINEER), &values);
        let prompt = template::fill(SELF_IMPROVE_PROMPT, &values);

        let mut agent = ChatAgent::new(PROMPT_ENGINEER, &system_prompt, Arc::clone(&ctx.backend));
        env.record(Utterance::new("User", &prompt, None));
        let reply = agent
            .step(&prompt)
            .await
            .map_err(|e| ChainError::from_backend("SelfImprove", e))?;

        let Some(response) = reply.response else {
            warn!("Prompt Engineer produced no reply, keeping the original task");
            return Ok(self.task_prompt.clone());
        };
        env.cost.add(agent.model_name(), &response);
        env.record(Utterance::new(PROMPT_ENGINEER, &response.content, None));

        let revised = template::conclusion(&response.content, &ctx.config.termination_marker);
        if revised.is_empty() {
            return Ok(self.task_prompt.clone());
        }
        Ok(revised)
    }

    fn remove_pycache(dir: &Path) -> ChainResult<()> {
        let caches: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir() && e.file_name() == "__pycache__")
            .map(|e| e.path().to_path_buf())
            .collect();
        for cache in caches {
            fs::remove_dir_all(&cache).map_err(io_error(&cache))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleHooks for WarehouseStaging {
    async fn pre_run(&self, ctx: &HookContext<'_>, env: &mut SharedEnvironment) -> ChainResult<()> {
        if ctx.config.clear_structure {
            self.clear_warehouse()?;
        }

        let artifact_dir = self.artifact_directory();
        fs::create_dir_all(&artifact_dir).map_err(io_error(&artifact_dir))?;
        env.set_artifact_directory(&artifact_dir);
        self.copy_configs(&artifact_dir)?;

        if ctx.config.incremental_develop {
            match &self.code_path {
                Some(code_path) => self.stage_code_base(code_path, env)?,
                None => warn!("incremental_develop is set but no code path was given"),
            }
        }

        let prompt_file = artifact_dir.join(format!("{}.prompt", self.project_name));
        fs::write(&prompt_file, &self.task_prompt).map_err(io_error(&prompt_file))?;

        env.set_task_description(&self.task_prompt);
        if ctx.config.self_improve {
            let improved = self.improve_task(ctx, env).await?;
            info!("Self-improved task prompt: {}", improved);
            env.set_task_prompt(&improved);
        } else {
            env.set_task_prompt(&self.task_prompt);
        }

        info!("Staged run directory {}", artifact_dir.display());
        Ok(())
    }

    async fn post_run(
        &self,
        ctx: &HookContext<'_>,
        env: &mut SharedEnvironment,
        failure: Option<&ChainError>,
    ) -> ChainResult<()> {
        if let Some(err) = failure {
            warn!("Finalizing after failed run: {}", err);
        }
        let artifact_dir = env.artifact_directory().to_path_buf();

        env.write_meta(&self.config_dir)?;

        if ctx.config.git_management
            && let Some(tracker) = ctx.tracker
        {
            let version = env.bump_version();
            let sha = tracker.commit_all(&format!("v{} Final Version", version))?;
            info!("Final commit {}", sha);
            for line in tracker.log()? {
                info!("git log: {}", line);
            }
        }

        if ctx.config.clear_structure {
            Self::remove_pycache(&artifact_dir)?;
        }

        if let Some(log_file) = &self.log_file
            && log_file.is_file()
            && let Some(name) = log_file.file_name()
        {
            let target = artifact_dir.join(name);
            if let Err(e) = fs::rename(log_file, &target) {
                warn!("Failed to move log file to {}: {}", target.display(), e);
            }
        }

        info!(
            version = env.version(),
            tokens = env.cost.total_tokens(),
            "Run finalized in {}",
            artifact_dir.display()
        );
        Ok(())
    }
}
