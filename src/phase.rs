//! Phase model and JSON loading for the chat chain.
//!
//! This module provides:
//! - `PhaseStep` — one entry of the declarative pipeline (`chain` in ChatChainConfig.json)
//! - `PhaseType` — simple vs composed, keeping unknown spellings for validation
//! - `PhaseDefinition` — per simple phase roles and prompt template (PhaseConfig.json)
//! - `RoleBook` — role prompts by role name (RoleConfig.json)

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::chain_config::deserialize_flag;

/// Kind of a pipeline step.
///
/// Unknown spellings are kept verbatim so that load-time validation can report
/// them instead of failing inside the JSON parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseType {
    Simple,
    Composed,
    Unknown(String),
}

impl PhaseType {
    pub fn as_str(&self) -> &str {
        match self {
            PhaseType::Simple => "SimplePhase",
            PhaseType::Composed => "ComposedPhase",
            PhaseType::Unknown(raw) => raw,
        }
    }
}

impl From<String> for PhaseType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "SimplePhase" | "Simple" => PhaseType::Simple,
            "ComposedPhase" | "Composed" => PhaseType::Composed,
            _ => PhaseType::Unknown(raw),
        }
    }
}

impl<'de> Deserialize<'de> for PhaseType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(PhaseType::from)
    }
}

impl Serialize for PhaseType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for PhaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the pipeline.
///
/// Simple steps carry `max_turn_step`/`need_reflect`; composed steps carry
/// `cycleNum` and either an inline `Composition` or nothing, in which case the
/// definition is looked up by name in `composed_phases`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStep {
    pub phase: String,
    #[serde(rename = "phaseType")]
    pub phase_type: PhaseType,
    /// Turn limit for the role-play; `<= 0` selects the chain default
    #[serde(default)]
    pub max_turn_step: i64,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub need_reflect: bool,
    #[serde(rename = "cycleNum", default, skip_serializing_if = "Option::is_none")]
    pub cycle_num: Option<u32>,
    #[serde(rename = "Composition", default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<Vec<PhaseStep>>,
}

impl PhaseStep {
    /// Create a simple step.
    pub fn simple(phase: &str, max_turn_step: i64, need_reflect: bool) -> Self {
        Self {
            phase: phase.to_string(),
            phase_type: PhaseType::Simple,
            max_turn_step,
            need_reflect,
            cycle_num: None,
            composition: None,
        }
    }

    /// Create a composed step with an inline child sequence.
    pub fn composed(phase: &str, cycle_num: u32, composition: Vec<PhaseStep>) -> Self {
        Self {
            phase: phase.to_string(),
            phase_type: PhaseType::Composed,
            max_turn_step: 0,
            need_reflect: false,
            cycle_num: Some(cycle_num),
            composition: Some(composition),
        }
    }

    /// Create a composed step that refers to a named definition.
    pub fn composed_ref(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            phase_type: PhaseType::Composed,
            max_turn_step: 0,
            need_reflect: false,
            cycle_num: None,
            composition: None,
        }
    }

    /// Resolve the effective turn limit for a simple step.
    pub fn turn_limit(&self, definition: &PhaseDefinition, chain_default: u32) -> u32 {
        if self.max_turn_step > 0 {
            u32::try_from(self.max_turn_step).unwrap_or(u32::MAX)
        } else {
            definition.turn_limit.unwrap_or(chain_default).max(1)
        }
    }
}

/// Definition of a composed phase: how many cycles and which children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedPhaseDefinition {
    #[serde(rename = "cycleNum")]
    pub cycle_count: u32,
    #[serde(rename = "Composition")]
    pub child_sequence: Vec<PhaseStep>,
}

/// Definition of a simple phase (one entry of PhaseConfig.json).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    #[serde(rename = "assistant_role_name")]
    pub assistant_role: String,
    #[serde(rename = "user_role_name")]
    pub user_role: String,
    /// Prompt paragraphs, joined with blank lines
    #[serde(rename = "phase_prompt")]
    pub prompt_lines: Vec<String>,
    /// Default turn limit when the pipeline step does not set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_limit: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub needs_reflection: bool,
}

impl PhaseDefinition {
    pub fn new(assistant_role: &str, user_role: &str, prompt: &str) -> Self {
        Self {
            assistant_role: assistant_role.to_string(),
            user_role: user_role.to_string(),
            prompt_lines: vec![prompt.to_string()],
            turn_limit: None,
            needs_reflection: false,
        }
    }

    /// The prompt template with paragraphs joined by blank lines.
    pub fn prompt_template(&self) -> String {
        self.prompt_lines.join("\n\n")
    }
}

/// All simple phase definitions, keyed by phase name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseBook {
    pub phases: BTreeMap<String, PhaseDefinition>,
}

impl PhaseBook {
    /// Load phase definitions from PhaseConfig.json.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase config: {}", path.display()))?;

        let book: PhaseBook = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phase config JSON: {}", path.display()))?;

        Ok(book)
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.get(name)
    }

    pub fn insert(&mut self, name: &str, definition: PhaseDefinition) {
        self.phases.insert(name.to_string(), definition);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.phases.keys().map(String::as_str)
    }
}

/// Role prompts by role name (RoleConfig.json), each a list of lines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleBook {
    pub roles: BTreeMap<String, Vec<String>>,
}

impl RoleBook {
    /// Load role prompts from RoleConfig.json.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read role config: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse role config JSON: {}", path.display()))
    }

    /// Role prompt with lines joined by newlines; empty for unknown roles.
    pub fn prompt(&self, role: &str) -> String {
        self.roles
            .get(role)
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn insert(&mut self, role: &str, prompt: &str) {
        self.roles
            .insert(role.to_string(), prompt.lines().map(str::to_string).collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_phase_step_simple_from_json() {
        let json = r#"{
            "phase": "DemandAnalysis",
            "phaseType": "SimplePhase",
            "max_turn_step": -1,
            "need_reflect": "True"
        }"#;

        let step: PhaseStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.phase, "DemandAnalysis");
        assert_eq!(step.phase_type, PhaseType::Simple);
        assert_eq!(step.max_turn_step, -1);
        assert!(step.need_reflect);
        assert!(step.composition.is_none());
    }

    #[test]
    fn test_phase_step_composed_from_json() {
        let json = r#"{
            "phase": "CodeReview",
            "phaseType": "ComposedPhase",
            "cycleNum": 3,
            "Composition": [
                {"phase": "CodeReviewComment", "phaseType": "SimplePhase", "max_turn_step": 1, "need_reflect": "False"},
                {"phase": "CodeReviewModification", "phaseType": "SimplePhase", "max_turn_step": 1, "need_reflect": "False"}
            ]
        }"#;

        let step: PhaseStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.phase_type, PhaseType::Composed);
        assert_eq!(step.cycle_num, Some(3));
        let children = step.composition.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].phase, "CodeReviewModification");
    }

    #[test]
    fn test_unknown_phase_type_is_preserved() {
        let json = r#"{"phase": "X", "phaseType": "Unknown"}"#;
        let step: PhaseStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.phase_type, PhaseType::Unknown("Unknown".into()));
        assert_eq!(step.phase_type.to_string(), "Unknown");
    }

    #[test]
    fn test_turn_limit_resolution() {
        let mut def = PhaseDefinition::new("Programmer", "CTO", "write code");
        let step = PhaseStep::simple("Coding", 0, false);
        assert_eq!(step.turn_limit(&def, 10), 10);

        def.turn_limit = Some(4);
        assert_eq!(step.turn_limit(&def, 10), 4);

        let explicit = PhaseStep::simple("Coding", 2, false);
        assert_eq!(explicit.turn_limit(&def, 10), 2);
    }

    #[test]
    fn test_phase_book_load_joins_prompt_paragraphs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PhaseConfig.json");
        fs::write(
            &path,
            r#"{
                "DemandAnalysis": {
                    "assistant_role_name": "Chief Product Officer",
                    "user_role_name": "Chief Executive Officer",
                    "phase_prompt": ["First paragraph.", "Task: {task}"]
                }
            }"#,
        )
        .unwrap();

        let book = PhaseBook::load(&path).unwrap();
        let def = book.get("DemandAnalysis").unwrap();
        assert_eq!(def.assistant_role, "Chief Product Officer");
        assert_eq!(def.prompt_template(), "First paragraph.\n\nTask: {task}");
        assert!(!def.needs_reflection);
    }

    #[test]
    fn test_phase_book_load_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("PhaseConfig.json");
        fs::write(&path, "{ invalid json }").unwrap();

        let err = PhaseBook::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse phase config JSON"));
    }

    #[test]
    fn test_role_book_joins_lines() {
        let book: RoleBook = serde_json::from_str(
            r#"{"Programmer": ["{chatdev_prompt}", "You are Programmer."]}"#,
        )
        .unwrap();
        assert_eq!(book.prompt("Programmer"), "{chatdev_prompt}\nYou are Programmer.");
        assert_eq!(book.prompt("Nobody"), "");
        assert!(book.contains("Programmer"));
    }
}
