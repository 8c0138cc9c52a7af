//! Git worktrees for task handoff.
//!
//! Each handed-off task gets its own branch `handoff/<task>` checked out in a
//! worktree under `<repo>/.convoy-worktrees/`, so the receiving account can
//! pick up the work without disturbing the sender's checkout.

use anyhow::{Context, Result, bail};
use git2::{BranchType, Repository, StatusOptions, WorktreeAddOptions, WorktreePruneOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const WORKTREE_DIR: &str = ".convoy-worktrees";
const BRANCH_PREFIX: &str = "handoff/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandoffWorkspace {
    pub repo_root: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceStatus {
    pub exists: bool,
    pub dirty: bool,
    /// Branch currently checked out in the worktree.
    pub head: Option<String>,
}

/// Branch name used for a task's handoff worktree.
pub fn handoff_branch(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}{}", sanitize_name(task_id))
}

/// Create (or reuse) the worktree for `task_id` in the repository containing
/// `repo_path`. The branch starts at the repository's current HEAD.
pub fn prepare_handoff_worktree(repo_path: &Path, task_id: &str) -> Result<HandoffWorkspace> {
    let repo = Repository::discover(repo_path)
        .with_context(|| format!("{} is not inside a git repository", repo_path.display()))?;
    let repo_root = repo_root(&repo);

    let slug = sanitize_name(task_id);
    if slug.is_empty() {
        bail!("task id {task_id:?} has no usable characters for a worktree name");
    }
    let branch = handoff_branch(task_id);
    let name = format!("convoy-{slug}");
    let worktree_path = repo_root.join(WORKTREE_DIR).join(&name);

    if let Ok(existing) = repo.find_worktree(&name)
        && existing.validate().is_ok()
    {
        tracing::debug!(path = %worktree_path.display(), "reusing handoff worktree");
        return Ok(HandoffWorkspace {
            repo_root,
            worktree_path: existing.path().to_path_buf(),
            branch,
        });
    }

    let branch_ref = ensure_local_branch(&repo, &branch)?;
    std::fs::create_dir_all(repo_root.join(WORKTREE_DIR))
        .context("failed to create worktree directory")?;

    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&branch_ref));
    repo.worktree(&name, &worktree_path, Some(&opts))
        .with_context(|| format!("failed to add worktree {}", worktree_path.display()))?;

    tracing::info!(task_id = %task_id, path = %worktree_path.display(), branch = %branch, "handoff worktree created");
    Ok(HandoffWorkspace {
        repo_root,
        worktree_path,
        branch,
    })
}

pub fn workspace_status(worktree_path: &Path) -> Result<WorkspaceStatus> {
    if !worktree_path.exists() {
        return Ok(WorkspaceStatus {
            exists: false,
            dirty: false,
            head: None,
        });
    }
    let repo = Repository::open(worktree_path)
        .with_context(|| format!("failed to open worktree {}", worktree_path.display()))?;
    let head = repo
        .head()
        .ok()
        .and_then(|h| h.shorthand().map(ToOwned::to_owned));
    Ok(WorkspaceStatus {
        exists: true,
        dirty: detect_dirty(&repo)?,
        head,
    })
}

pub fn detect_dirty(repo: &Repository) -> Result<bool> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .include_ignored(false)
        .recurse_untracked_dirs(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(!statuses.is_empty())
}

/// Remove a handoff worktree. Refuses when it has uncommitted changes; the
/// branch is kept so committed work survives.
pub fn remove_handoff_worktree(repo_root: &Path, worktree_path: &Path) -> Result<()> {
    if workspace_status(worktree_path)?.dirty {
        bail!(
            "worktree {} has uncommitted changes",
            worktree_path.display()
        );
    }

    let repo = Repository::open(repo_root)?;
    let entries = repo.worktrees()?;
    for name in entries.iter().flatten() {
        let wt = repo.find_worktree(name)?;
        if canonical_eq(wt.path(), worktree_path) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(true);
            wt.prune(Some(&mut opts))?;
            return Ok(());
        }
    }

    if worktree_path.exists() {
        std::fs::remove_dir_all(worktree_path)?;
    }
    Ok(())
}

fn repo_root(repo: &Repository) -> PathBuf {
    repo.workdir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| repo.path().to_path_buf())
}

fn ensure_local_branch<'repo>(
    repo: &'repo Repository,
    branch: &str,
) -> Result<git2::Reference<'repo>> {
    if let Ok(existing) = repo.find_branch(branch, BranchType::Local) {
        return Ok(existing.into_reference());
    }

    let commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .context("repository has no commits to branch from")?;
    let created = repo.branch(branch, &commit, false)?;
    Ok(created.into_reference())
}

fn sanitize_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_lowercase()
}

fn canonical_eq(left: &Path, right: &Path) -> bool {
    let a = std::fs::canonicalize(left).ok();
    let b = std::fs::canonicalize(right).ok();
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}
