//! The shared environment threaded through a chain run.
//!
//! One [`SharedEnvironment`] exists per run. The executor owns it and lends
//! `&mut` access to one phase at a time. Memory is append-only: there is no
//! API that removes or rewrites an [`Utterance`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

use crate::backend::{CompletionResponse, pricing};
use crate::errors::{ChainError, ChainResult};

/// Text substituted for `{gui}` when GUI design is requested.
const GUI_PROMPT: &str = "The software should be equipped with graphical user interface (GUI) \
so that user can visually and graphically use it; so you must choose a GUI framework \
(e.g., in Python, you can implement GUI via tkinter, Pygame, Flexx, PyGUI, etc,).";

/// Attempts allowed per unimplemented file before code completion gives up on it.
pub const MAX_COMPLETION_ATTEMPTS: u32 = 10;

/// Extensions loaded from an existing code base.
const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "rs", "js", "ts", "html", "css", "java", "go", "c", "cpp", "h", "sh", "json", "toml",
];

/// Token usage of one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One entry of the run memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    role: String,
    content: String,
    token_usage: Option<TokenUsage>,
}

impl Utterance {
    pub fn new(role: &str, content: &str, token_usage: Option<TokenUsage>) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            token_usage,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn token_usage(&self) -> Option<TokenUsage> {
        self.token_usage
    }
}

/// Running totals of token usage and cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostAccumulator {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl CostAccumulator {
    /// Add one backend call.
    pub fn add(&mut self, model: &str, response: &CompletionResponse) {
        self.calls += 1;
        self.prompt_tokens += u64::from(response.prompt_tokens);
        self.completion_tokens += u64::from(response.completion_tokens);
        self.cost_usd += pricing::prompt_cost(model, response.prompt_tokens, response.completion_tokens);
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// FILENAME line, then a fenced block
static CODE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)([^\n]*)\n```([A-Za-z0-9_+\-]*)[^\n]*\n(.*?)```").expect("code block regex")
});

static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_\-./]+\.[A-Za-z0-9]+").expect("filename regex"));

/// True when `name` stays inside the directory it is joined onto.
fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Source files produced by coding phases, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    files: BTreeMap<String, String>,
}

impl Codebook {
    /// Parse ``FILENAME\n```lang\n...``` `` blocks from `text` and store them.
    ///
    /// Returns the names whose content changed.
    pub fn update_from_text(&mut self, text: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for caps in CODE_BLOCK_RE.captures_iter(text) {
            let header = caps[1].trim().trim_matches(|c| c == '*' || c == '`' || c == '#');
            let Some(name) = FILENAME_RE.find_iter(header).last().map(|m| m.as_str()) else {
                continue;
            };
            let name = name.trim_start_matches("./").to_string();
            if !is_contained(&name) {
                warn!(file = %name, "Skipping code block whose file name leaves the artifact directory");
                continue;
            }
            let code = caps[3].trim_end().to_string();
            if code.is_empty() {
                continue;
            }
            if self.files.get(&name) != Some(&code) {
                self.files.insert(name.clone(), code);
                changed.push(name);
            }
        }
        changed
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, code: &str) {
        self.files.insert(name.to_string(), code.to_string());
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// All files formatted for a prompt.
    pub fn render(&self) -> String {
        self.files
            .iter()
            .map(|(name, code)| {
                let lang = Path::new(name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("");
                format!("{}\n```{}\n{}\n```\n", name, lang, code)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Files that still contain placeholder bodies.
    pub fn unimplemented(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|(_, code)| {
                code.lines().any(|line| {
                    let line = line.trim();
                    line == "pass" || line.contains("unimplemented!()") || line.contains("todo!()")
                })
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Write every file under `dir`.
    pub fn write_all(&self, dir: &Path) -> ChainResult<()> {
        for (name, code) in &self.files {
            if !is_contained(name) {
                return Err(ChainError::Configuration(format!(
                    "file name '{}' leaves the artifact directory",
                    name
                )));
            }
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| ChainError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&path, format!("{}\n", code))
                .map_err(|source| ChainError::Io { path, source })?;
        }
        Ok(())
    }

    /// Load source files from an existing code base.
    pub fn load_from_dir(dir: &Path) -> ChainResult<Self> {
        let mut book = Self::default();
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_source = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
            if !is_source {
                continue;
            }
            let code = std::fs::read_to_string(path).map_err(|source| ChainError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if let Ok(relative) = path.strip_prefix(dir) {
                book.insert(&relative.to_string_lossy(), code.trim_end());
            }
        }
        Ok(book)
    }
}

/// The mutable state of one run.
#[derive(Debug, Clone, Default)]
pub struct SharedEnvironment {
    task_prompt: String,
    task_description: String,
    artifact_directory: PathBuf,
    memory: Vec<Utterance>,
    version: u32,
    recruited: BTreeSet<String>,

    pub cost: CostAccumulator,
    pub codebook: Codebook,
    pub gui_design: bool,
    pub modality: String,
    pub language: String,
    pub ideas: String,
    pub review_comments: String,
    pub test_reports: String,
    pub error_summary: String,
    pub exist_bugs: bool,
    pub requirements: String,
    pub manual: String,
    pub notes: Vec<String>,
    /// Code completion attempts per file
    pub completion_attempts: BTreeMap<String, u32>,
    /// File picked by the latest code completion; `None` once nothing is left
    pub unimplemented_file: Option<String>,
}

impl SharedEnvironment {
    pub fn new(task_prompt: &str, artifact_directory: &Path) -> Self {
        Self {
            task_prompt: task_prompt.to_string(),
            artifact_directory: artifact_directory.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn task_prompt(&self) -> &str {
        &self.task_prompt
    }

    pub fn set_task_prompt(&mut self, prompt: &str) {
        self.task_prompt = prompt.to_string();
    }

    pub fn task_description(&self) -> &str {
        &self.task_description
    }

    pub fn set_task_description(&mut self, description: &str) {
        self.task_description = description.to_string();
    }

    pub fn artifact_directory(&self) -> &Path {
        &self.artifact_directory
    }

    pub fn set_artifact_directory(&mut self, dir: &Path) {
        self.artifact_directory = dir.to_path_buf();
    }

    /// Register a persona for later phases.
    pub fn recruit(&mut self, name: &str) {
        self.recruited.insert(name.to_string());
    }

    pub fn is_recruited(&self, name: &str) -> bool {
        self.recruited.contains(name)
    }

    pub fn roster(&self) -> impl Iterator<Item = &str> {
        self.recruited.iter().map(String::as_str)
    }

    /// Append one utterance to memory.
    pub fn record(&mut self, utterance: Utterance) {
        self.memory.push(utterance);
    }

    pub fn memory(&self) -> &[Utterance] {
        &self.memory
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Mark a new artifact state and return the new version.
    pub fn bump_version(&mut self) -> u32 {
        self.version += 1;
        self.version
    }

    /// Next unimplemented file that has attempts left.
    pub fn next_unimplemented_file(&self) -> Option<String> {
        self.codebook
            .unimplemented()
            .into_iter()
            .find(|name| {
                self.completion_attempts.get(*name).copied().unwrap_or(0) < MAX_COMPLETION_ATTEMPTS
            })
            .map(str::to_string)
    }

    /// Values for prompt placeholders.
    pub fn placeholders(&self) -> BTreeMap<&'static str, String> {
        let mut values = BTreeMap::new();
        values.insert("task", self.task_prompt.clone());
        values.insert("description", self.task_description.clone());
        values.insert("modality", self.modality.clone());
        values.insert("language", self.language.clone());
        values.insert("ideas", self.ideas.clone());
        values.insert("codes", self.codebook.render());
        values.insert("comments", self.review_comments.clone());
        values.insert("test_reports", self.test_reports.clone());
        values.insert("error_summary", self.error_summary.clone());
        values.insert(
            "unimplemented_file",
            self.unimplemented_file
                .clone()
                .or_else(|| self.next_unimplemented_file())
                .unwrap_or_default(),
        );
        values.insert(
            "gui",
            if self.gui_design {
                GUI_PROMPT.to_string()
            } else {
                String::new()
            },
        );
        values
    }

    /// Write `meta.txt` summarizing the run into the artifact directory.
    pub fn write_meta(&self, config_dir: &Path) -> ChainResult<PathBuf> {
        let roster: Vec<&str> = self.roster().collect();
        let meta = format!(
            "Task:\n{}\n\nConfig:\n{}\n\nRoster:\n{}\n\nModality:\n{}\n\nIdeas:\n{}\n\nLanguage:\n{}\n\n\
             Code_Version:\n{}\n\nCalls:\n{}\n\nTokens:\n{}\n\nCost:\n${:.6}\n",
            self.task_prompt,
            config_dir.display(),
            roster.join(", "),
            self.modality,
            self.ideas,
            self.language,
            self.version,
            self.cost.calls,
            self.cost.total_tokens(),
            self.cost.cost_usd
        );

        let path = self.artifact_directory.join("meta.txt");
        std::fs::write(&path, meta).map_err(|source| ChainError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
