//! Closed phase-handler registry and load-time pipeline validation.
//!
//! Phase names from the configuration map onto a fixed set of handler kinds.
//! A pipeline is validated against the registry before the run starts, so an
//! unknown phase type, an unregistered name or a cyclic composition fails
//! before the first backend call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chain_config::ChainConfig;
use crate::errors::{ChainError, ChainResult};
use crate::phase::{PhaseBook, PhaseStep, PhaseType};

use super::graph::{CompositionGraph, CompositionGraphBuilder};

/// Extraction rule applied to the conclusion of a simple phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimplePhaseKind {
    /// Conclusion becomes the product modality.
    DemandAnalysis,
    /// Conclusion becomes the programming language.
    LanguageChoose,
    /// Conclusion becomes the idea list.
    Brainstorm,
    /// Code blocks are written into the codebook and the artifact directory.
    Coding,
    CodeComplete,
    CodeReviewModification,
    TestModification,
    /// Conclusion becomes the review comments.
    CodeReviewComment,
    /// Runs the test command, conclusion becomes the error summary.
    TestErrorSummary,
    /// Conclusion is written to requirements.txt.
    EnvironmentDoc,
    /// Conclusion is written to manual.md.
    Manual,
    /// Conclusion is appended to the environment notes.
    Note,
}

impl SimplePhaseKind {
    /// Whether this handler writes source files and bumps the version.
    pub fn writes_code(self) -> bool {
        matches!(
            self,
            SimplePhaseKind::Coding
                | SimplePhaseKind::CodeComplete
                | SimplePhaseKind::CodeReviewModification
                | SimplePhaseKind::TestModification
        )
    }
}

/// Break rule of a composed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComposedPhaseKind {
    /// Runs every declared cycle.
    Cycle,
    /// Stops once no unimplemented file is left in the codebook.
    CodeCompleteAll,
    /// Stops once the reviewer concludes with "Finished".
    CodeReview,
    /// Stops once the test command reports no bugs.
    Test,
}

/// Mapping from phase name to handler kind.
#[derive(Debug, Clone, Default)]
pub struct PhaseRegistry {
    simple: BTreeMap<String, SimplePhaseKind>,
    composed: BTreeMap<String, ComposedPhaseKind>,
}

impl PhaseRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the phase names of the default software company.
    pub fn chatdev() -> Self {
        use SimplePhaseKind::*;

        let mut registry = Self::new();
        for (name, kind) in [
            ("DemandAnalysis", DemandAnalysis),
            ("LanguageChoose", LanguageChoose),
            ("Brainstorm", Brainstorm),
            ("Coding", Coding),
            ("CodeComplete", CodeComplete),
            ("CodeReviewComment", CodeReviewComment),
            ("CodeReviewModification", CodeReviewModification),
            ("TestErrorSummary", TestErrorSummary),
            ("TestModification", TestModification),
            ("EnvironmentDoc", EnvironmentDoc),
            ("Manual", Manual),
            ("ArtDesign", Note),
            ("ArtIntegration", Note),
            ("CodeReviewHuman", Note),
        ] {
            registry.register_simple(name, kind);
        }

        registry
            .register_composed("CodeCompleteAll", ComposedPhaseKind::CodeCompleteAll)
            .register_composed("CodeReview", ComposedPhaseKind::CodeReview)
            .register_composed("Test", ComposedPhaseKind::Test)
            .register_composed("HumanAgentInteraction", ComposedPhaseKind::Cycle);
        registry
    }

    pub fn register_simple(&mut self, name: &str, kind: SimplePhaseKind) -> &mut Self {
        self.simple.insert(name.to_string(), kind);
        self
    }

    pub fn register_composed(&mut self, name: &str, kind: ComposedPhaseKind) -> &mut Self {
        self.composed.insert(name.to_string(), kind);
        self
    }

    pub fn simple(&self, name: &str) -> Option<SimplePhaseKind> {
        self.simple.get(name).copied()
    }

    pub fn composed(&self, name: &str) -> Option<ComposedPhaseKind> {
        self.composed.get(name).copied()
    }
}

/// A pipeline that passed load-time validation.
#[derive(Debug, Clone)]
pub struct ValidatedPipeline {
    pub steps: Vec<PhaseStep>,
    pub graph: CompositionGraph,
}

impl ValidatedPipeline {
    /// Validate `config` against the phase definitions and the registry.
    ///
    /// Checks run in a fixed order so that validating the same input twice
    /// yields the same error kind:
    /// 1. every step has a known phase type
    /// 2. the composition graph resolves and is acyclic
    /// 3. every simple phase has a definition and a handler, every composed
    ///    phase has a handler
    pub fn validate(
        config: &ChainConfig,
        phases: &PhaseBook,
        registry: &PhaseRegistry,
    ) -> ChainResult<Self> {
        if config.termination_marker.trim().is_empty() {
            return Err(ChainError::Configuration(
                "termination_marker must not be empty".to_string(),
            ));
        }

        let mut all_steps: Vec<&PhaseStep> = Vec::new();
        for step in &config.chain {
            flatten(step, &mut all_steps);
        }
        for definition in config.composed_phases.values() {
            for child in &definition.child_sequence {
                flatten(child, &mut all_steps);
            }
        }

        for step in &all_steps {
            if let PhaseType::Unknown(raw) = &step.phase_type {
                return Err(ChainError::UnknownPhaseType {
                    phase: step.phase.clone(),
                    phase_type: raw.clone(),
                });
            }
        }

        let graph = CompositionGraphBuilder::new(&config.chain, &config.composed_phases).build()?;

        for step in &all_steps {
            match step.phase_type {
                PhaseType::Simple => {
                    if phases.get(&step.phase).is_none() || registry.simple(&step.phase).is_none() {
                        return Err(ChainError::PhaseNotImplemented {
                            phase: step.phase.clone(),
                            kind: "simple",
                        });
                    }
                }
                PhaseType::Composed => {
                    if registry.composed(&step.phase).is_none() {
                        return Err(ChainError::PhaseNotImplemented {
                            phase: step.phase.clone(),
                            kind: "composed",
                        });
                    }
                }
                PhaseType::Unknown(_) => {}
            }
        }

        Ok(Self {
            steps: config.chain.clone(),
            graph,
        })
    }

    /// Number of simple phase executions a full run performs, assuming no
    /// handler breaks out of a composed phase early.
    pub fn planned_executions(&self) -> u64 {
        self.steps.iter().map(|step| self.count(step)).sum()
    }

    fn count(&self, step: &PhaseStep) -> u64 {
        match step.phase_type {
            PhaseType::Composed => self
                .graph
                .definition(&step.phase)
                .map(|def| {
                    let per_cycle: u64 = def.child_sequence.iter().map(|c| self.count(c)).sum();
                    u64::from(def.cycle_count) * per_cycle
                })
                .unwrap_or(0),
            _ => 1,
        }
    }
}

fn flatten<'s>(step: &'s PhaseStep, out: &mut Vec<&'s PhaseStep>) {
    out.push(step);
    if let Some(children) = &step.composition {
        for child in children {
            flatten(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{ComposedPhaseDefinition, PhaseDefinition};

    fn book(names: &[&str]) -> PhaseBook {
        let mut book = PhaseBook::default();
        for name in names {
            book.insert(name, PhaseDefinition::new("Programmer", "Reviewer", "do {task}"));
        }
        book
    }

    fn registry(simple: &[&str], composed: &[&str]) -> PhaseRegistry {
        let mut registry = PhaseRegistry::new();
        for name in simple {
            registry.register_simple(name, SimplePhaseKind::Note);
        }
        for name in composed {
            registry.register_composed(name, ComposedPhaseKind::Cycle);
        }
        registry
    }

    fn config(chain: Vec<PhaseStep>) -> ChainConfig {
        ChainConfig {
            chain,
            ..ChainConfig::default()
        }
    }

    #[test]
    fn test_valid_pipeline() {
        let cfg = config(vec![
            PhaseStep::simple("Spec", 1, false),
            PhaseStep::composed("Loop", 2, vec![PhaseStep::simple("Code", 3, false)]),
        ]);
        let pipeline =
            ValidatedPipeline::validate(&cfg, &book(&["Spec", "Code"]), &registry(&["Spec", "Code"], &["Loop"]))
                .unwrap();
        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.planned_executions(), 3);
    }

    #[test]
    fn test_empty_termination_marker_rejected() {
        let mut cfg = config(vec![PhaseStep::simple("Spec", 1, false)]);
        cfg.termination_marker = " ".into();
        let err = ValidatedPipeline::validate(&cfg, &book(&["Spec"]), &registry(&["Spec"], &[])).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(err.to_string().contains("termination_marker"));
    }

    #[test]
    fn test_unknown_phase_type() {
        let mut step = PhaseStep::simple("Spec", 1, false);
        step.phase_type = PhaseType::Unknown("Unknown".into());
        let err = ValidatedPipeline::validate(&config(vec![step]), &book(&["Spec"]), &registry(&["Spec"], &[]))
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_phase_type");
    }

    #[test]
    fn test_unknown_phase_type_nested() {
        let mut inner = PhaseStep::simple("Spec", 1, false);
        inner.phase_type = PhaseType::Unknown("Parallel".into());
        let cfg = config(vec![PhaseStep::composed("Loop", 1, vec![inner])]);
        let err = ValidatedPipeline::validate(&cfg, &book(&["Spec"]), &registry(&["Spec"], &["Loop"]))
            .unwrap_err();
        assert!(matches!(err, ChainError::UnknownPhaseType { ref phase_type, .. } if phase_type == "Parallel"));
    }

    #[test]
    fn test_missing_definition_is_not_implemented() {
        let cfg = config(vec![PhaseStep::simple("Ghost", 1, false)]);
        let err = ValidatedPipeline::validate(&cfg, &book(&[]), &registry(&["Ghost"], &[])).unwrap_err();
        assert!(matches!(err, ChainError::PhaseNotImplemented { kind: "simple", .. }));
    }

    #[test]
    fn test_unregistered_simple_handler() {
        let cfg = config(vec![PhaseStep::simple("Spec", 1, false)]);
        let err = ValidatedPipeline::validate(&cfg, &book(&["Spec"]), &registry(&[], &[])).unwrap_err();
        assert_eq!(err.kind(), "phase_not_implemented");
    }

    #[test]
    fn test_unregistered_composed_handler() {
        let cfg = config(vec![PhaseStep::composed("Loop", 1, vec![PhaseStep::simple("Spec", 1, false)])]);
        let err = ValidatedPipeline::validate(&cfg, &book(&["Spec"]), &registry(&["Spec"], &[])).unwrap_err();
        assert!(matches!(err, ChainError::PhaseNotImplemented { kind: "composed", .. }));
    }

    #[test]
    fn test_cycle_is_configuration_error_and_stable() {
        let mut cfg = config(vec![PhaseStep::composed_ref("A")]);
        cfg.composed_phases.insert(
            "A".into(),
            ComposedPhaseDefinition {
                cycle_count: 1,
                child_sequence: vec![PhaseStep::composed_ref("B")],
            },
        );
        cfg.composed_phases.insert(
            "B".into(),
            ComposedPhaseDefinition {
                cycle_count: 1,
                child_sequence: vec![PhaseStep::composed_ref("A")],
            },
        );
        let phases = book(&[]);
        let reg = registry(&[], &["A", "B"]);

        let first = ValidatedPipeline::validate(&cfg, &phases, &reg).unwrap_err();
        let second = ValidatedPipeline::validate(&cfg, &phases, &reg).unwrap_err();
        assert_eq!(first.kind(), "configuration");
        assert_eq!(first.kind(), second.kind());
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_planned_executions_nested() {
        let cfg = config(vec![PhaseStep::composed(
            "Outer",
            2,
            vec![
                PhaseStep::simple("A", 1, false),
                PhaseStep::composed("Inner", 3, vec![PhaseStep::simple("B", 1, false)]),
            ],
        )]);
        let pipeline = ValidatedPipeline::validate(
            &cfg,
            &book(&["A", "B"]),
            &registry(&["A", "B"], &["Outer", "Inner"]),
        )
        .unwrap();
        assert_eq!(pipeline.planned_executions(), 2 * (1 + 3));
    }

    #[test]
    fn test_chatdev_registry() {
        let registry = PhaseRegistry::chatdev();
        assert_eq!(registry.simple("Coding"), Some(SimplePhaseKind::Coding));
        assert!(registry.simple("Coding").unwrap().writes_code());
        assert_eq!(registry.composed("Test"), Some(ComposedPhaseKind::Test));
        assert!(registry.simple("Unheard").is_none());
    }
}
