use super::{AuditRun, PhaseAudit, RunConfig};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// File name of the audit record inside the artifact directory.
pub const AUDIT_FILE: &str = "audit.json";

/// Keeps the audit record of one run and mirrors it to `audit.json`.
pub struct AuditLogger {
    run_file: PathBuf,
    current_run: Option<AuditRun>,
}

impl AuditLogger {
    pub fn new(artifact_dir: &Path) -> Self {
        Self {
            run_file: artifact_dir.join(AUDIT_FILE),
            current_run: None,
        }
    }

    /// Logger that keeps the record in memory until [`AuditLogger::relocate`] is called.
    pub fn detached() -> Self {
        Self {
            run_file: PathBuf::new(),
            current_run: None,
        }
    }

    /// Write future saves to `artifact_dir`.
    pub fn relocate(&mut self, artifact_dir: &Path) -> Result<()> {
        self.run_file = artifact_dir.join(AUDIT_FILE);
        if let Some(run) = self.current_run.as_mut() {
            run.config.artifact_dir = artifact_dir.to_path_buf();
        }
        self.save_current()
    }

    pub fn start_run(&mut self, config: RunConfig) -> Result<()> {
        self.current_run = Some(AuditRun::new(config));
        self.save_current()
    }

    /// Add a phase audit record to the current run.
    ///
    /// Errors when no run is active.
    pub fn add_phase(&mut self, phase: PhaseAudit) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("add_phase called with no active run"))?;
        run.phases.push(phase);
        self.save_current()
    }

    /// Add a phase record; a failed save is logged and the record stays in memory.
    pub fn record_phase(&mut self, phase: PhaseAudit) {
        if let Err(e) = self.add_phase(phase) {
            warn!(file = %self.run_file.display(), "Audit record not saved: {:#}", e);
        }
    }

    /// Apply a mutation to the last phase in the current run.
    pub fn update_last_phase<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PhaseAudit),
    {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("update_last_phase called with no active run"))?;
        let phase = run
            .phases
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("update_last_phase called with no phases in run"))?;
        f(phase);
        self.save_current()
    }

    /// Record the error that stopped the chain.
    pub fn record_error(&mut self, message: &str) -> Result<()> {
        if let Some(run) = self.current_run.as_mut() {
            run.error = Some(message.to_string());
        }
        self.save_current()
    }

    /// Close the run and write the final record.
    pub fn finish_run(&mut self) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.finish();
        self.save_current()?;
        Ok(self.run_file.clone())
    }

    pub fn save_current(&self) -> Result<()> {
        if self.run_file.as_os_str().is_empty() {
            return Ok(());
        }
        let Some(parent) = self.run_file.parent() else {
            return Ok(());
        };
        if !parent.exists() {
            return Ok(());
        }
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(run).context("Failed to serialize audit run")?;
            fs::write(&self.run_file, json).context("Failed to write audit run file")?;
        }
        Ok(())
    }

    pub fn current_run(&self) -> Option<&AuditRun> {
        self.current_run.as_ref()
    }

    pub fn load_run(path: &Path) -> Result<AuditRun> {
        let content = fs::read_to_string(path).context("Failed to read audit run file")?;
        let run: AuditRun =
            serde_json::from_str(&content).context("Failed to parse audit run file")?;
        Ok(run)
    }
}
