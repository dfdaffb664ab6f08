use crate::audit::FileChangeSummary;
use anyhow::{Context, Result};
use git2::{Delta, Repository, Signature};
use std::path::{Path, PathBuf};

const SIGNATURE_NAME: &str = "chatchain";
const SIGNATURE_EMAIL: &str = "chatchain@localhost";

/// Versions the artifact directory with git.
///
/// Holds only the path; the repository is reopened per operation so the
/// tracker can be shared across await points.
#[derive(Debug, Clone)]
pub struct GitTracker {
    dir: PathBuf,
}

impl GitTracker {
    /// Open the repository in `dir`, initializing one if needed.
    pub fn init(dir: &Path) -> Result<Self> {
        if Repository::open(dir).is_err() {
            Repository::init(dir)
                .with_context(|| format!("Failed to init git repository in {}", dir.display()))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.dir).context("Failed to open git repository")
    }

    /// Stage everything and commit with `message`. Returns the commit SHA.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let repo = self.repo()?;
        let mut index = repo.index()?;

        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let sig = Signature::now(SIGNATURE_NAME, SIGNATURE_EMAIL)?;

        // Handle unborn branch (new repo with no commits yet)
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        Ok(commit_id.to_string())
    }

    /// Files touched by the HEAD commit.
    pub fn last_commit_changes(&self) -> Result<FileChangeSummary> {
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        let new_tree = head.tree()?;
        let old_tree = match head.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };

        let diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?;

        let mut summary = FileChangeSummary::default();
        for delta in diff.deltas() {
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_path_buf();
            match delta.status() {
                Delta::Added => summary.files_added.push(path),
                Delta::Modified => summary.files_modified.push(path),
                Delta::Deleted => summary.files_deleted.push(path),
                _ => {}
            }
        }

        Ok(summary)
    }

    /// One line per commit, newest first: `<short sha> <summary>`.
    pub fn log(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        if repo.head().is_err() {
            return Ok(Vec::new());
        }

        let mut walk = repo.revwalk()?;
        walk.push_head()?;

        let mut lines = Vec::new();
        for oid in walk {
            let commit = repo.find_commit(oid?)?;
            let sha = commit.id().to_string();
            lines.push(format!(
                "{} {}",
                &sha[..7],
                commit.summary().unwrap_or_default()
            ));
        }
        Ok(lines)
    }

    /// Current HEAD SHA (None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        let repo = self.repo().ok()?;
        let head = repo.head().ok()?.peel_to_commit().ok()?;
        Some(head.id().to_string())
    }
}
