//! Composition graph for composed phases.
//!
//! Nodes are composed phase names; an edge `a -> b` means composed phase `a`
//! lists composed phase `b` among its children. Definitions come from inline
//! `Composition` blocks in the chain and from the named `composed_phases`
//! table. The graph must be acyclic: a cycle would make the run recurse forever,
//! so it is rejected before any model call is made.

use std::collections::{BTreeMap, HashMap};

use crate::errors::{ChainError, ChainResult};
use crate::phase::{ComposedPhaseDefinition, PhaseStep, PhaseType};

/// Index into the composed definition list.
pub type NodeIndex = usize;

/// Acyclic graph of composed phase definitions.
#[derive(Debug, Clone)]
pub struct CompositionGraph {
    /// Definitions indexed by position
    names: Vec<String>,
    definitions: Vec<ComposedPhaseDefinition>,
    /// Map from composed phase name to index
    index_map: HashMap<String, NodeIndex>,
    /// Forward edges: index -> composed children it references
    forward_edges: Vec<Vec<NodeIndex>>,
}

impl CompositionGraph {
    /// Number of composed definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Get the definition of a composed phase by name.
    pub fn definition(&self, name: &str) -> Option<&ComposedPhaseDefinition> {
        self.index_map.get(name).map(|&i| &self.definitions[i])
    }

    /// Names of the composed phases directly referenced by `name`.
    pub fn children(&self, name: &str) -> Vec<&str> {
        self.index_map
            .get(name)
            .map(|&i| {
                self.forward_edges[i]
                    .iter()
                    .map(|&c| self.names[c].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Maximum nesting depth below `name` (0 for a composed phase with only simple children).
    pub fn depth(&self, name: &str) -> usize {
        self.children(name)
            .into_iter()
            .map(|child| 1 + self.depth(child))
            .max()
            .unwrap_or(0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Builder collecting composed definitions from a chain.
pub struct CompositionGraphBuilder<'a> {
    chain: &'a [PhaseStep],
    named: &'a BTreeMap<String, ComposedPhaseDefinition>,
}

impl<'a> CompositionGraphBuilder<'a> {
    pub fn new(
        chain: &'a [PhaseStep],
        named: &'a BTreeMap<String, ComposedPhaseDefinition>,
    ) -> Self {
        Self { chain, named }
    }

    /// Build the graph.
    ///
    /// This validates the definition structure:
    /// - Every composed reference resolves to exactly one definition
    /// - An inline definition may not contradict another definition of the same name
    /// - No cycles are allowed
    pub fn build(self) -> ChainResult<CompositionGraph> {
        let mut collected: BTreeMap<String, ComposedPhaseDefinition> = self.named.clone();

        for step in self.chain {
            collect_inline(step, &mut collected)?;
        }
        for definition in self.named.values() {
            for child in &definition.child_sequence {
                collect_inline(child, &mut collected)?;
            }
        }

        // Every composed reference must resolve
        let mut references: Vec<&PhaseStep> = Vec::new();
        for step in self.chain {
            gather_composed(step, &mut references);
        }
        for definition in collected.values() {
            for child in &definition.child_sequence {
                gather_composed(child, &mut references);
            }
        }
        for step in &references {
            if !collected.contains_key(&step.phase) {
                return Err(ChainError::Configuration(format!(
                    "Composed phase '{}' has neither an inline Composition nor an entry in composed_phases",
                    step.phase
                )));
            }
        }

        let names: Vec<String> = collected.keys().cloned().collect();
        let definitions: Vec<ComposedPhaseDefinition> = collected.into_values().collect();
        let index_map: HashMap<String, NodeIndex> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); definitions.len()];
        for (from_idx, definition) in definitions.iter().enumerate() {
            for child in &definition.child_sequence {
                if child.phase_type == PhaseType::Composed
                    && let Some(&to_idx) = index_map.get(&child.phase)
                    && !forward_edges[from_idx].contains(&to_idx)
                {
                    forward_edges[from_idx].push(to_idx);
                }
            }
        }

        let graph = CompositionGraph {
            names,
            definitions,
            index_map,
            forward_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &CompositionGraph) -> ChainResult<()> {
        let mut in_degree: Vec<usize> = vec![0; graph.len()];
        for edges in &graph.forward_edges {
            for &to in edges {
                in_degree[to] += 1;
            }
        }

        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &child in &graph.forward_edges[node] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push(child);
                }
            }
        }

        if processed != graph.len() {
            let cycle_phases: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| graph.names[i].as_str())
                .collect();

            return Err(ChainError::Configuration(format!(
                "Cycle detected in composed phase definitions. Involved phases: {:?}",
                cycle_phases
            )));
        }

        Ok(())
    }
}

/// Record inline composed definitions found in `step` and its descendants.
fn collect_inline(
    step: &PhaseStep,
    collected: &mut BTreeMap<String, ComposedPhaseDefinition>,
) -> ChainResult<()> {
    if step.phase_type != PhaseType::Composed {
        return Ok(());
    }
    let Some(children) = &step.composition else {
        return Ok(());
    };
    let cycle_count = step.cycle_num.ok_or_else(|| {
        ChainError::Configuration(format!(
            "Composed phase '{}' has a Composition but no cycleNum",
            step.phase
        ))
    })?;

    let definition = ComposedPhaseDefinition {
        cycle_count,
        child_sequence: children.clone(),
    };

    match collected.get(&step.phase) {
        Some(existing) if existing != &definition => {
            return Err(ChainError::Configuration(format!(
                "Conflicting definitions for composed phase '{}'",
                step.phase
            )));
        }
        Some(_) => {}
        None => {
            collected.insert(step.phase.clone(), definition);
        }
    }

    for child in children {
        collect_inline(child, collected)?;
    }
    Ok(())
}

fn gather_composed<'s>(step: &'s PhaseStep, out: &mut Vec<&'s PhaseStep>) {
    if step.phase_type != PhaseType::Composed {
        return;
    }
    out.push(step);
    if let Some(children) = &step.composition {
        for child in children {
            gather_composed(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(name: &str) -> PhaseStep {
        PhaseStep::simple(name, 1, false)
    }

    fn named(entries: Vec<(&str, u32, Vec<PhaseStep>)>) -> BTreeMap<String, ComposedPhaseDefinition> {
        entries
            .into_iter()
            .map(|(name, cycles, children)| {
                (
                    name.to_string(),
                    ComposedPhaseDefinition {
                        cycle_count: cycles,
                        child_sequence: children,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_build_inline_nesting() {
        let chain = vec![
            simple("Spec"),
            PhaseStep::composed(
                "Outer",
                2,
                vec![simple("A"), PhaseStep::composed("Inner", 3, vec![simple("B")])],
            ),
        ];
        let graph = CompositionGraphBuilder::new(&chain, &BTreeMap::new())
            .build()
            .unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.children("Outer"), vec!["Inner"]);
        assert_eq!(graph.depth("Outer"), 1);
        assert_eq!(graph.definition("Inner").unwrap().cycle_count, 3);
    }

    #[test]
    fn test_named_reference_resolves() {
        let chain = vec![PhaseStep::composed_ref("Review")];
        let defs = named(vec![("Review", 2, vec![simple("Comment")])]);

        let graph = CompositionGraphBuilder::new(&chain, &defs).build().unwrap();
        assert_eq!(graph.definition("Review").unwrap().child_sequence.len(), 1);
    }

    #[test]
    fn test_missing_definition() {
        let chain = vec![PhaseStep::composed_ref("Nowhere")];
        let err = CompositionGraphBuilder::new(&chain, &BTreeMap::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, ChainError::Configuration(_)));
        assert!(err.to_string().contains("Nowhere"));
    }

    #[test]
    fn test_cycle_detection() {
        let chain = vec![PhaseStep::composed_ref("A")];
        let defs = named(vec![
            ("A", 1, vec![PhaseStep::composed_ref("B")]),
            ("B", 1, vec![PhaseStep::composed_ref("C")]),
            ("C", 1, vec![simple("X"), PhaseStep::composed_ref("A")]),
        ]);

        let err = CompositionGraphBuilder::new(&chain, &defs).build().unwrap_err();
        assert!(matches!(err, ChainError::Configuration(_)));
        assert!(err.to_string().contains("Cycle"));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let chain = vec![PhaseStep::composed(
            "Loop",
            2,
            vec![simple("A"), PhaseStep::composed_ref("Loop")],
        )];
        let err = CompositionGraphBuilder::new(&chain, &BTreeMap::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Loop"));
    }

    #[test]
    fn test_conflicting_inline_definitions() {
        let chain = vec![
            PhaseStep::composed("Review", 2, vec![simple("A")]),
            PhaseStep::composed("Review", 3, vec![simple("A")]),
        ];
        let err = CompositionGraphBuilder::new(&chain, &BTreeMap::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Conflicting"));
    }

    #[test]
    fn test_repeated_identical_inline_definition_is_fine() {
        let chain = vec![
            PhaseStep::composed("Review", 2, vec![simple("A")]),
            simple("B"),
            PhaseStep::composed("Review", 2, vec![simple("A")]),
        ];
        let graph = CompositionGraphBuilder::new(&chain, &BTreeMap::new())
            .build()
            .unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_missing_cycle_num() {
        let mut step = PhaseStep::composed("Review", 1, vec![simple("A")]);
        step.cycle_num = None;
        let err = CompositionGraphBuilder::new(&[step], &BTreeMap::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cycleNum"));
    }

    #[test]
    fn test_empty_graph() {
        let graph = CompositionGraphBuilder::new(&[simple("A")], &BTreeMap::new())
            .build()
            .unwrap();
        assert!(graph.is_empty());
    }
}
