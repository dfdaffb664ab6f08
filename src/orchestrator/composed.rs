use futures::future::BoxFuture;
use tracing::info;

use super::PhaseContext;
use super::executor::{prepare_step, run_step};
use crate::audit::{AuditLogger, CyclePosition, PhaseAudit, PhaseOutcome, TokenUsage};
use crate::env::SharedEnvironment;
use crate::errors::{ChainError, ChainResult};
use crate::phase::ComposedPhaseDefinition;
use crate::pipeline::ComposedPhaseKind;

/// A composed phase: its child sequence repeated `cycle_count` times.
pub struct ComposedPhase<'d> {
    name: String,
    kind: ComposedPhaseKind,
    definition: &'d ComposedPhaseDefinition,
}

impl<'d> ComposedPhase<'d> {
    pub fn new(name: &str, kind: ComposedPhaseKind, definition: &'d ComposedPhaseDefinition) -> Self {
        Self {
            name: name.to_string(),
            kind,
            definition,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Break rule of this handler kind, checked before and after every child.
    pub fn should_break(&self, env: &SharedEnvironment) -> bool {
        match self.kind {
            ComposedPhaseKind::Cycle => false,
            ComposedPhaseKind::CodeCompleteAll => {
                env.unimplemented_file.is_none() && env.next_unimplemented_file().is_none()
            }
            ComposedPhaseKind::CodeReview => env.review_comments.contains("Finished"),
            ComposedPhaseKind::Test => !env.exist_bugs,
        }
    }

    /// Run every cycle in order. Children may be composed phases themselves,
    /// hence the boxed future.
    pub fn execute<'a>(
        &'a self,
        ctx: &'a PhaseContext<'a>,
        env: &'a mut SharedEnvironment,
        audit: &'a mut AuditLogger,
        position: Option<CyclePosition>,
    ) -> BoxFuture<'a, ChainResult<()>> {
        Box::pin(async move {
            info!(
                phase = %self.name,
                cycles = self.definition.cycle_count,
                children = self.definition.child_sequence.len(),
                "composed phase started"
            );
            let started = PhaseAudit::new(&self.name, "composed", position);
            let tokens_before = (env.cost.prompt_tokens, env.cost.completion_tokens);

            let result = self.run_cycles(ctx, env, audit).await;

            let mut record = started;
            record.token_usage = TokenUsage {
                prompt_tokens: env.cost.prompt_tokens - tokens_before.0,
                completion_tokens: env.cost.completion_tokens - tokens_before.1,
            };
            record.version_after = env.version();
            record.finish(match &result {
                Ok(Some(cycle)) => PhaseOutcome::BrokeEarly { cycle: *cycle },
                Ok(None) => PhaseOutcome::Completed,
                Err(ChainError::Cancelled { .. }) => PhaseOutcome::Cancelled,
                Err(e) => PhaseOutcome::Error {
                    message: e.to_string(),
                },
            });
            audit.record_phase(record);

            if let Ok(Some(cycle)) = &result {
                info!(phase = %self.name, cycle, "break condition met, leaving cycle loop");
            }
            result.map(|_| ())
        })
    }

    /// Returns the cycle index that triggered a break, if any.
    async fn run_cycles(
        &self,
        ctx: &PhaseContext<'_>,
        env: &mut SharedEnvironment,
        audit: &mut AuditLogger,
    ) -> ChainResult<Option<u32>> {
        for cycle in 0..self.definition.cycle_count {
            for child in &self.definition.child_sequence {
                let position = CyclePosition {
                    parent: self.name.clone(),
                    cycle,
                };
                // A child's own preparation (test run, file pick) may already settle the loop
                let prepared = prepare_step(ctx, env, child).await?;
                if self.should_break(env) {
                    return Ok(Some(cycle));
                }
                run_step(ctx, env, audit, child, Some(position), prepared).await?;
                if self.should_break(env) {
                    return Ok(Some(cycle));
                }
            }
        }
        Ok(None)
    }
}
