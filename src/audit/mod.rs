use crate::session::TerminationReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    pub phases: Vec<PhaseAudit>,
    /// Error that stopped the chain, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRun {
    pub fn new(config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            config,
            phases: Vec::new(),
            error: None,
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Total backend tokens over all recorded phases.
    pub fn total_tokens(&self) -> u64 {
        self.phases
            .iter()
            .map(|p| p.token_usage.prompt_tokens + p.token_usage.completion_tokens)
            .sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub project_name: String,
    pub org_name: String,
    pub task: String,
    pub model: String,
    pub platform: String,
    pub config_dir: PathBuf,
    pub artifact_dir: PathBuf,
}

/// Where a phase ran inside the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePosition {
    /// Enclosing composed phase
    pub parent: String,
    /// Zero-based cycle index
    pub cycle: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseAudit {
    pub phase: String,
    pub phase_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<CyclePosition>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_reason: Option<TerminationReason>,
    pub token_usage: TokenUsage,
    pub version_after: u32,
    pub outcome: PhaseOutcome,
    #[serde(default)]
    pub file_changes: FileChangeSummary,
}

impl PhaseAudit {
    pub fn new(phase: &str, phase_type: &str, position: Option<CyclePosition>) -> Self {
        Self {
            phase: phase.to_string(),
            phase_type: phase_type.to_string(),
            position,
            started_at: Utc::now(),
            ended_at: None,
            turns: 0,
            terminated_reason: None,
            token_usage: TokenUsage::default(),
            version_after: 0,
            outcome: PhaseOutcome::InProgress,
            file_changes: FileChangeSummary::default(),
        }
    }

    pub fn finish(&mut self, outcome: PhaseOutcome) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
}

impl FileChangeSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_files() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PhaseOutcome {
    InProgress,
    Completed,
    /// A composed phase left its cycle loop early
    BrokeEarly { cycle: u32 },
    Error { message: String },
    Cancelled,
}

pub mod logger;
pub use logger::AuditLogger;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_run_new() {
        let run = AuditRun::new(RunConfig {
            project_name: "Gomoku".into(),
            ..RunConfig::default()
        });
        assert!(run.ended_at.is_none());
        assert!(run.phases.is_empty());
        assert_eq!(run.config.project_name, "Gomoku");
    }

    #[test]
    fn test_phase_audit_finish() {
        let mut phase = PhaseAudit::new(
            "CodeReviewComment",
            "simple",
            Some(CyclePosition {
                parent: "CodeReview".into(),
                cycle: 1,
            }),
        );
        assert_eq!(phase.outcome, PhaseOutcome::InProgress);
        phase.finish(PhaseOutcome::Completed);
        assert!(phase.duration_secs().is_some());
    }

    #[test]
    fn test_total_tokens() {
        let mut run = AuditRun::new(RunConfig::default());
        let mut phase = PhaseAudit::new("Coding", "simple", None);
        phase.token_usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        run.phases.push(phase.clone());
        run.phases.push(phase);
        assert_eq!(run.total_tokens(), 300);
    }

    #[test]
    fn test_phase_audit_serializes_reason() {
        let mut phase = PhaseAudit::new("Coding", "simple", None);
        phase.terminated_reason = Some(TerminationReason::TerminationTokenSeen);
        let json = serde_json::to_string(&phase).unwrap();
        assert!(json.contains("termination_token_seen"));
        assert!(!json.contains("position"));
    }
}
