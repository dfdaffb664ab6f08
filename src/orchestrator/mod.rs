//! Phase execution: simple phases, composed phases and the chain executor.

mod composed;
mod executor;
mod hooks;
mod simple;

pub use composed::ComposedPhase;
pub use executor::{ChainExecutor, RunSummary};
pub use hooks::{HookContext, LifecycleHooks, NoopHooks, WarehouseStaging};
pub use simple::{SimplePhase, TestReport, run_test_command};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::ModelBackend;
use crate::chain_config::ChainConfig;
use crate::errors::{ChainError, ChainResult};
use crate::phase::{PhaseBook, RoleBook};
use crate::pipeline::{CompositionGraph, PhaseRegistry};
use crate::tracker::GitTracker;

/// Cooperative cancellation, checked before every phase.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`ChainError::Cancelled`] if cancellation was requested.
    pub fn check(&self, next_phase: &str) -> ChainResult<()> {
        if self.is_cancelled() {
            return Err(ChainError::Cancelled {
                phase: next_phase.to_string(),
            });
        }
        Ok(())
    }
}

/// Read-only run state lent to every phase.
#[derive(Clone)]
pub struct PhaseContext<'a> {
    pub config: &'a ChainConfig,
    pub phases: &'a PhaseBook,
    pub roles: &'a RoleBook,
    pub registry: &'a PhaseRegistry,
    pub graph: &'a CompositionGraph,
    pub backend: Arc<dyn ModelBackend>,
    pub tracker: Option<&'a GitTracker>,
    pub cancel: &'a CancelFlag,
    pub message_window: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_shared_between_clones() {
        let flag = CancelFlag::new();
        let handle = flag.clone();
        assert!(flag.check("Coding").is_ok());

        handle.cancel();
        let err = flag.check("Coding").unwrap_err();
        assert!(matches!(err, ChainError::Cancelled { ref phase } if phase == "Coding"));
    }
}
