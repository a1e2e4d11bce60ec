use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use commodore_process::{CommandOutput, Invocation};

use crate::error::Error;
use crate::model::RepoHandle;
use crate::workdir::Workdir;

/// Content-addressed store of bare clones plus named dependency worktrees.
///
/// One bare repository per canonical remote URL under
/// `dependencies/.repos/<host>/<path>.git`; it exclusively owns the object
/// storage. Worktrees under `dependencies/<name>` are `git worktree`
/// checkouts linked back to it by path, so any number of dependencies
/// share one object store. Each remote is fetched at most once per
/// compile.
///
/// Locking is two-level: a per-remote lock covers clone/fetch against the
/// bare repository, and a per-`(remote, worktree name)` lock covers
/// materialization, so different dependencies of one remote check out
/// concurrently while operations on one worktree stay serialized. The
/// shared maps below are only locked momentarily, never across a
/// subprocess.
#[derive(Debug)]
pub struct RepoCache {
    repos_root: PathBuf,
    worktrees_root: PathBuf,
    force: bool,
    git_bin: String,
    remote_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
    worktree_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
    fetched: Mutex<BTreeSet<String>>,
}

/// A materialized checkout at a resolved commit.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub commit: String,
}

impl RepoCache {
    pub fn new(workdir: &Workdir, force: bool) -> Self {
        Self {
            repos_root: workdir.repos(),
            worktrees_root: workdir.dependencies(),
            force,
            git_bin: commodore_process::git_program(),
            remote_locks: Mutex::new(BTreeMap::new()),
            worktree_locks: Mutex::new(BTreeMap::new()),
            fetched: Mutex::new(BTreeSet::new()),
        }
    }

    /// Ensure `dependencies/<name>` is a clean checkout of `repo` at its
    /// pinned revision. Idempotent; advancing an existing worktree needs
    /// a clean tree or `--force`.
    pub fn ensure_worktree(&self, repo: &RepoHandle, name: &str) -> Result<Worktree> {
        let canonical = repo.canonical_url();

        // Fetch phase under the per-remote lock only; materialization of
        // different worktrees from one bare clone runs concurrently.
        let (bare, commit) = {
            let remote_lock = lock_entry(&self.remote_locks, &canonical);
            let _guard = remote_lock.lock().unwrap_or_else(|e| e.into_inner());
            let bare = self.ensure_bare(repo)?;
            let commit = self.resolve_revision(&bare, repo)?;
            (bare, commit)
        };

        let worktree_lock = lock_entry(&self.worktree_locks, &format!("{canonical}::{name}"));
        let _guard = worktree_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.worktrees_root.join(name);
        self.materialize(&bare, &path, &commit)
            .with_context(|| format!("failed to check out dependency `{name}`"))?;
        Ok(Worktree { path, commit })
    }

    /// HEAD commit of an existing worktree.
    pub fn head_commit(&self, worktree: &Path) -> Result<String> {
        let out = self.git(worktree).args(["rev-parse", "HEAD"]).run_ok()?;
        Ok(out.stdout.trim().to_string())
    }

    fn bare_path(&self, repo: &RepoHandle) -> PathBuf {
        let (host, path) = repo.cache_segments();
        let mut out = self.repos_root.join(host);
        out.push(format!("{path}.git"));
        out
    }

    fn git(&self, dir: &Path) -> Invocation {
        Invocation::new(self.git_bin.as_str())
            .current_dir(dir)
            .passthrough("SSH_AUTH_SOCK")
    }

    /// Clone the bare repository, or refresh its references. Each remote
    /// is refreshed once per compile; transient network failures are
    /// retried once before escalating. The caller holds the per-remote
    /// lock.
    fn ensure_bare(&self, repo: &RepoHandle) -> Result<PathBuf> {
        let bare = self.bare_path(repo);
        let canonical = repo.canonical_url();

        let needs_clone = !bare.join("HEAD").is_file();
        let needs_fetch = !needs_clone && {
            let fetched = self.fetched.lock().unwrap_or_else(|e| e.into_inner());
            !fetched.contains(&canonical)
        };

        if needs_clone {
            if let Some(parent) = bare.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let clone = Invocation::new(self.git_bin.as_str())
                .passthrough("SSH_AUTH_SOCK")
                .args(["clone", "--bare", &repo.url])
                .arg(bare.to_string_lossy().to_string());
            let out = self.run_network_op(&clone)?;
            if !out.success() {
                bail!(classify_remote_failure(&repo.url, &out));
            }
        }

        // Bare clones carry no remote configuration of their own; pin the
        // fetch and push URLs explicitly. The configuration is shared
        // with every linked worktree.
        self.git(&bare)
            .args(["config", "remote.origin.url", &repo.url])
            .run_ok()?;
        self.git(&bare)
            .args(["config", "remote.origin.pushurl", &repo.push_url()])
            .run_ok()?;

        if needs_fetch {
            let fetch = self.git(&bare).args([
                "fetch",
                "--force",
                "--prune",
                "--tags",
                "origin",
                "+refs/heads/*:refs/heads/*",
            ]);
            let out = self.run_network_op(&fetch)?;
            if !out.success() {
                bail!(classify_remote_failure(&repo.url, &out));
            }
        }
        self.fetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(canonical);

        Ok(bare)
    }

    /// Run a clone/fetch, retrying once when the failure looks transient.
    fn run_network_op(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let out = invocation.run()?;
        if out.success() || !is_transient(&out.stderr) {
            return Ok(out);
        }
        invocation.run()
    }

    /// Resolve the handle's tree-ish (branch, tag, SHA, `HEAD~N`, ...) to
    /// a commit id against the bare clone.
    fn resolve_revision(&self, bare: &Path, repo: &RepoHandle) -> Result<String> {
        let revision = repo.revision.as_deref().unwrap_or("HEAD");
        let out = self
            .git(bare)
            .args(["rev-parse", "--verify", &format!("{revision}^{{commit}}")])
            .run()?;
        if !out.success() {
            bail!(Error::UnresolvedRevision {
                revision: revision.to_string(),
                url: repo.url.clone(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Check out `commit` at `path` as a linked worktree of `bare`. The
    /// worktree owns only its checkout directory; objects, refs and the
    /// remote configuration live in the bare clone.
    fn materialize(&self, bare: &Path, path: &Path, commit: &str) -> Result<()> {
        if !path.join(".git").exists() {
            // A manually deleted checkout leaves a stale registration in
            // the bare repository; prune before re-adding.
            self.git(bare).args(["worktree", "prune"]).run_ok()?;
            self.git(bare)
                .args(["worktree", "add", "--quiet", "--detach"])
                .arg(path.to_string_lossy().to_string())
                .arg(commit)
                .run_ok()?;
        } else {
            let head = self.head_commit(path)?;

            // Already at the target commit: nothing to do.
            if head != commit {
                if self.is_dirty(path)? && !self.force {
                    bail!(Error::DirtyWorktree(path.display().to_string()));
                }
                if self.force {
                    self.git(path)
                        .args(["reset", "--hard", "--quiet", commit])
                        .run_ok()?;
                    self.git(path).args(["clean", "-ffdx", "--quiet"]).run_ok()?;
                } else {
                    self.git(path)
                        .args(["checkout", "--quiet", "--detach", commit])
                        .run_ok()?;
                }
            }
        }

        Ok(())
    }

    fn is_dirty(&self, path: &Path) -> Result<bool> {
        let out = self.git(path).args(["status", "--porcelain"]).run_ok()?;
        Ok(!out.stdout.trim().is_empty())
    }
}

fn lock_entry(locks: &Mutex<BTreeMap<String, Arc<Mutex<()>>>>, key: &str) -> Arc<Mutex<()>> {
    let mut locks = locks.lock().unwrap_or_else(|e| e.into_inner());
    locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Sort a clone/fetch failure into the typed error kinds.
fn classify_remote_failure(url: &str, out: &CommandOutput) -> Error {
    let stderr = out.stderr.trim().to_string();
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("permission denied")
        || lowered.contains("authentication failed")
        || lowered.contains("access denied")
        || lowered.contains("403")
    {
        Error::PermissionDenied {
            url: url.to_string(),
            detail: stderr,
        }
    } else {
        Error::UnreachableRemote {
            url: url.to_string(),
            detail: stderr,
        }
    }
}

/// Whether a git failure looks like a transient network problem worth one
/// retry.
fn is_transient(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    [
        "could not resolve host",
        "unable to access",
        "connection reset",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "early eof",
        "the remote end hung up",
        "could not read from remote repository",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}
