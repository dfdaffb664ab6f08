//! Chain configuration (`ChatChainConfig.json`).
//!
//! The chain config declares the pipeline and the run-wide flags:
//!
//! ```json
//! {
//!   "chain": [
//!     {"phase": "DemandAnalysis", "phaseType": "SimplePhase", "max_turn_step": -1, "need_reflect": "True"},
//!     {"phase": "CodeReview", "phaseType": "ComposedPhase", "cycleNum": 3, "Composition": [
//!       {"phase": "CodeReviewComment", "phaseType": "SimplePhase", "max_turn_step": 1, "need_reflect": "False"}
//!     ]}
//!   ],
//!   "recruitments": ["Chief Executive Officer", "Programmer"],
//!   "clear_structure": "True",
//!   "git_management": "False",
//!   "incremental_develop": "False",
//!   "gui_design": "True",
//!   "self_improve": "False",
//!   "background_prompt": "ChatDev is a software company ...",
//!   "termination_marker": "<INFO>",
//!   "default_turn_limit": 10,
//!   "test_command": "python main.py"
//! }
//! ```
//!
//! Flags accept JSON booleans as well as the `"True"`/`"False"` strings used by
//! existing company configs. Unknown keys are ignored.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::phase::{ComposedPhaseDefinition, PhaseStep};

/// Default sentinel that ends a role-play dialogue.
pub const DEFAULT_TERMINATION_MARKER: &str = "<INFO>";

/// Turn limit used when neither the step nor the phase definition sets one.
pub const DEFAULT_TURN_LIMIT: u32 = 10;

/// Deserialize a flag given either as a bool or as a "True"/"False" string.
pub fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s.trim().eq_ignore_ascii_case("true"),
    })
}

fn default_termination_marker() -> String {
    DEFAULT_TERMINATION_MARKER.to_string()
}

fn default_turn_limit() -> u32 {
    DEFAULT_TURN_LIMIT
}

/// The complete ChatChainConfig.json structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Ordered pipeline of phase steps
    pub chain: Vec<PhaseStep>,
    /// Personas registered with the environment before the chain starts
    #[serde(default)]
    pub recruitments: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub clear_structure: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub git_management: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub incremental_develop: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub gui_design: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub self_improve: bool,
    /// Accepted for existing company configs; long-term memory is not supported
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub with_memory: bool,
    /// Accepted for existing company configs; web task enrichment is not supported
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub web_spider: bool,
    /// Shared background text substituted into every role prompt
    #[serde(default)]
    pub background_prompt: String,
    /// Named composed phase definitions referenced from the chain
    #[serde(default)]
    pub composed_phases: BTreeMap<String, ComposedPhaseDefinition>,
    #[serde(default = "default_termination_marker")]
    pub termination_marker: String,
    #[serde(default = "default_turn_limit")]
    pub default_turn_limit: u32,
    /// Command run in the artifact directory by the test summary phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain: Vec::new(),
            recruitments: Vec::new(),
            clear_structure: false,
            git_management: false,
            incremental_develop: false,
            gui_design: false,
            self_improve: false,
            with_memory: false,
            web_spider: false,
            background_prompt: String::new(),
            composed_phases: BTreeMap::new(),
            termination_marker: default_termination_marker(),
            default_turn_limit: default_turn_limit(),
            test_command: None,
        }
    }
}

impl ChainConfig {
    /// Load the chain configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain config: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse chain config: {}", path.display()))
    }

    /// Parse the chain configuration from a JSON string.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid ChatChainConfig JSON")
    }

    /// Non-fatal configuration problems worth showing to the user.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.chain.is_empty() {
            warnings.push("Chain is empty: no phase will run".to_string());
        }
        if self.recruitments.is_empty() {
            warnings.push("No recruitments declared".to_string());
        }
        if self.with_memory {
            warnings.push("with_memory is set but long-term memory is not supported; ignored".to_string());
        }
        if self.web_spider {
            warnings.push(
                "web_spider is set but web task enrichment is not supported; task_description keeps the raw task"
                    .to_string(),
            );
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseType;

    #[test]
    fn test_parse_string_flags() {
        let config = ChainConfig::parse(
            r#"{
                "chain": [],
                "recruitments": ["Programmer"],
                "clear_structure": "True",
                "git_management": "False",
                "incremental_develop": false,
                "gui_design": true,
                "self_improve": "false",
                "background_prompt": "We are a company.",
                "web_spider": "False",
                "with_memory": "False"
            }"#,
        )
        .unwrap();

        assert!(config.clear_structure);
        assert!(!config.git_management);
        assert!(!config.incremental_develop);
        assert!(config.gui_design);
        assert!(!config.self_improve);
        assert_eq!(config.background_prompt, "We are a company.");
        assert_eq!(config.termination_marker, DEFAULT_TERMINATION_MARKER);
        assert_eq!(config.default_turn_limit, DEFAULT_TURN_LIMIT);
    }

    #[test]
    fn test_parse_named_composed_phases() {
        let config = ChainConfig::parse(
            r#"{
                "chain": [{"phase": "Review", "phaseType": "ComposedPhase"}],
                "composed_phases": {
                    "Review": {
                        "cycleNum": 2,
                        "Composition": [{"phase": "CodeReviewComment", "phaseType": "SimplePhase"}]
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.chain[0].phase_type, PhaseType::Composed);
        let review = &config.composed_phases["Review"];
        assert_eq!(review.cycle_count, 2);
        assert_eq!(review.child_sequence[0].phase, "CodeReviewComment");
    }

    #[test]
    fn test_parse_missing_chain_fails() {
        let result = ChainConfig::parse(r#"{"recruitments": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_warnings() {
        let config = ChainConfig::default();
        assert_eq!(config.warnings().len(), 2);

        let config = ChainConfig::parse(
            r#"{"chain": [], "recruitments": ["Programmer"], "with_memory": "True", "web_spider": "True"}"#,
        )
        .unwrap();
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.starts_with("with_memory")));
        assert!(warnings.iter().any(|w| w.starts_with("web_spider")));
    }
}
