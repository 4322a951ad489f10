//! Per-run repository workspaces.
//!
//! Network operations (clone, push) run the git CLI as typed argument
//! vectors with credentials injected through [`GitAuth`]. Local operations
//! (branch, stage, commit) go through `git2`.

use crate::cancel::CancelSignal;
use crate::credentials::{AccessToken, GitAuth};
use crate::redact::Redacted;
use crate::util::{run_process, ProcessOutput, ProcessSpec};
use anyhow::{anyhow, bail, Context, Result};
use git2::{BranchType, Repository, Signature};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

/// Repository-relative path of the committed change manifest.
pub const MANIFEST_PATH: &str = ".council/work_orders.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "Council Executor".to_string(),
            email: "council-exec@users.noreply.github.com".to_string(),
        }
    }
}

/// Creates and tears down workspaces under one root directory.
pub struct WorkspaceManager {
    root: PathBuf,
    git_base_url: Url,
    identity: CommitIdentity,
    git_auth: Arc<dyn GitAuth>,
    git_timeout: Duration,
}

impl WorkspaceManager {
    pub fn new(
        root: impl Into<PathBuf>,
        git_base_url: Url,
        identity: CommitIdentity,
        git_auth: Arc<dyn GitAuth>,
        git_timeout: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            git_base_url,
            identity,
            git_auth,
            git_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The clone URL for a repository. Never carries credentials.
    pub fn remote_url(&self, owner: &str, repo: &str) -> Result<Url> {
        if !is_valid_repo_segment(owner) || !is_valid_repo_segment(repo) {
            bail!("Invalid repository name '{}/{}'", owner, repo);
        }
        let raw = format!(
            "{}/{}/{}.git",
            self.git_base_url.as_str().trim_end_matches('/'),
            owner,
            repo
        );
        let url = Url::parse(&raw).with_context(|| format!("Invalid remote URL '{}'", raw))?;
        ensure_credential_free(&url)?;
        Ok(url)
    }

    /// Clone `target_branch` into a fresh directory and switch to a new
    /// `source_branch` at the same commit.
    pub async fn checkout(
        &self,
        run_id: Uuid,
        owner: &str,
        repo: &str,
        target_branch: &str,
        source_branch: &str,
        token: Option<AccessToken>,
        cancel: &CancelSignal,
    ) -> Result<(Workspace, String)> {
        let url = self.remote_url(owner, repo)?;
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create workspace root '{}'", self.root.display())
        })?;
        let path = self.root.join(workspace_dir_name(owner, repo, run_id));

        // Owns the directory from here on, so a failed clone is removed too.
        let mut workspace = Workspace {
            path,
            target_branch: target_branch.to_string(),
            source_branch: source_branch.to_string(),
            token,
            git_auth: Arc::clone(&self.git_auth),
            identity: self.identity.clone(),
            git_timeout: self.git_timeout,
            removed: false,
        };

        let clone_args = vec![
            "clone".to_string(),
            "--branch".to_string(),
            target_branch.to_string(),
            "--single-branch".to_string(),
            "--no-tags".to_string(),
            "--".to_string(),
            url.to_string(),
            workspace.path.to_string_lossy().to_string(),
        ];
        let output = workspace
            .git(&self.root, clone_args, cancel)
            .await
            .context("git clone failed")?;
        let log = output.combined();

        let repo_path = workspace.path.clone();
        let branch = source_branch.to_string();
        tokio::task::spawn_blocking(move || create_and_checkout_branch(&repo_path, &branch))
            .await
            .context("Branch task failed")??;

        Ok((workspace, log))
    }

    /// Remove workspace directories older than `max_age`, left behind by a
    /// process that died mid-run.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.context("Failed to read workspace root")?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(now);
            let age = now.duration_since(modified).unwrap_or_default();
            if age < max_age {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(
                    path = %entry.path().display(),
                    error = %err,
                    "failed to remove stale workspace"
                ),
            }
        }
        Ok(removed)
    }
}

/// A cloned repository owned by one run. The directory is removed by
/// [`Workspace::cleanup`] or, failing that, on drop.
pub struct Workspace {
    path: PathBuf,
    target_branch: String,
    source_branch: String,
    token: Option<AccessToken>,
    git_auth: Arc<dyn GitAuth>,
    identity: CommitIdentity,
    git_timeout: Duration,
    removed: bool,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("path", &self.path)
            .field("source_branch", &self.source_branch)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_branch(&self) -> &str {
        &self.source_branch
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    async fn git(&self, cwd: &Path, args: Vec<String>, cancel: &CancelSignal) -> Result<ProcessOutput> {
        let mut spec = ProcessSpec::new("git", args, cwd, self.git_timeout);
        if let Some(token) = &self.token {
            spec = spec.with_env(self.git_auth.git_env(token));
        }
        let command = format!("git {}", spec.args.first().map(String::as_str).unwrap_or(""));
        let output = run_process(&spec, cancel).await?;
        if output.cancelled {
            bail!("{} cancelled", command);
        }
        if output.timed_out {
            bail!("{} timed out after {}s", command, self.git_timeout.as_secs());
        }
        if !output.success() {
            return Err(anyhow!(
                "{} exited with {}:\n{}",
                command,
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.combined().trim()
            ));
        }
        Ok(output)
    }

    /// Write the change manifest. Content is already redacted.
    pub fn write_manifest(&self, content: &Redacted<String>) -> Result<PathBuf> {
        let path = self.path.join(MANIFEST_PATH);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        std::fs::write(&path, content.as_str())
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        Ok(PathBuf::from(MANIFEST_PATH))
    }

    /// Stage the given repository-relative paths and commit on the source
    /// branch. Returns the commit id.
    pub async fn commit_files(&self, paths: Vec<PathBuf>, message: String) -> Result<String> {
        let repo_path = self.path.clone();
        let identity = self.identity.clone();
        tokio::task::spawn_blocking(move || commit_paths(&repo_path, &paths, &message, &identity))
            .await
            .context("Commit task failed")?
    }

    /// Number of commits on the source branch not on the target branch.
    pub fn commits_ahead(&self) -> Result<usize> {
        let repo = Repository::open(&self.path)?;
        let local = repo
            .find_branch(&self.source_branch, BranchType::Local)
            .with_context(|| format!("Branch '{}' not found", self.source_branch))?
            .get()
            .peel_to_commit()?
            .id();
        let upstream = repo
            .find_reference(&format!("refs/remotes/origin/{}", self.target_branch))
            .with_context(|| format!("Remote branch 'origin/{}' not found", self.target_branch))?
            .peel_to_commit()?
            .id();
        let (ahead, _) = repo.graph_ahead_behind(local, upstream)?;
        Ok(ahead)
    }

    /// Push the source branch to `origin`. Fails when there is nothing to
    /// push.
    pub async fn push(&self, cancel: &CancelSignal) -> Result<String> {
        if self.commits_ahead()? == 0 {
            bail!(
                "Branch '{}' has no commits beyond '{}'",
                self.source_branch,
                self.target_branch
            );
        }
        let refspec = format!(
            "refs/heads/{0}:refs/heads/{0}",
            self.source_branch
        );
        let args = vec![
            "push".to_string(),
            "--porcelain".to_string(),
            "origin".to_string(),
            refspec,
        ];
        let output = self
            .git(&self.path, args, cancel)
            .await
            .context("git push failed")?;
        Ok(output.combined())
    }

    /// Remove the workspace directory.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to remove workspace '{}'", self.path.display())),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

// ============================================================================
// git2 helpers
// ============================================================================

fn create_and_checkout_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open clone at '{}'", repo_path.display()))?;
    let commit = repo.head()?.peel_to_commit()?;
    repo.branch(name, &commit, false)
        .with_context(|| format!("Failed to create branch '{}'", name))?;
    repo.set_head(&format!("refs/heads/{}", name))
        .with_context(|| format!("Failed to check out branch '{}'", name))?;
    Ok(())
}

fn commit_paths(
    repo_path: &Path,
    paths: &[PathBuf],
    message: &str,
    identity: &CommitIdentity,
) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;
    for path in paths {
        index
            .add_path(path)
            .with_context(|| format!("Failed to stage '{}'", path.display()))?;
    }
    index.write()?;

    let tree_id = index.write_tree()?;
    let parent = repo.head()?.peel_to_commit()?;
    if parent.tree_id() == tree_id {
        bail!("Nothing to commit");
    }
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now(&identity.name, &identity.email)?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
    Ok(oid.to_string())
}

// ============================================================================
// Naming and URL checks
// ============================================================================

/// Owner and repository names: ASCII alphanumerics plus `-`, `_`, `.`, not
/// starting with `-` or `.`.
pub fn is_valid_repo_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= 100
        && !segment.starts_with('-')
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Reject URLs carrying a username or password.
pub fn ensure_credential_free(url: &Url) -> Result<()> {
    if !url.username().is_empty() || url.password().is_some() {
        bail!("Remote URL must not embed credentials");
    }
    if url.query_pairs().any(|(k, _)| crate::redact::is_sensitive_key(&k)) {
        bail!("Remote URL must not carry credential parameters");
    }
    Ok(())
}

fn workspace_dir_name(owner: &str, repo: &str, run_id: Uuid) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let run = run_id.simple().to_string();
    format!(
        "{}-{}-{}-{}",
        sanitize_component(owner),
        sanitize_component(repo),
        nanos,
        &run[..8]
    )
}

fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect::<String>();
    if cleaned.is_empty() {
        "repo".to_string()
    } else {
        cleaned
    }
}
