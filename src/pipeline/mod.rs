//! Pipeline validation: the composition graph and the phase registry.

pub mod graph;
pub mod registry;

pub use graph::{CompositionGraph, CompositionGraphBuilder};
pub use registry::{ComposedPhaseKind, PhaseRegistry, SimplePhaseKind, ValidatedPipeline};
