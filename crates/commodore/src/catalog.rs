use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use commodore_process::Invocation;

use crate::diff::{Migration, is_noise, split_diff};
use crate::error::Error;
use crate::workdir::{Workdir, copy_tree};

/// The cluster's catalog repository, checked out under `catalog/`.
#[derive(Debug)]
pub struct CatalogRepo {
    path: PathBuf,
    git_bin: String,
}

/// Clone the catalog, or refresh an existing checkout. Local
/// modifications block the refresh unless `force` is set.
pub fn checkout_catalog(workdir: &Workdir, url: &str, force: bool) -> Result<CatalogRepo> {
    let repo = CatalogRepo {
        path: workdir.catalog(),
        git_bin: commodore_process::git_program(),
    };

    if !repo.path.join(".git").exists() {
        let out = Invocation::new(repo.git_bin.as_str())
            .passthrough("SSH_AUTH_SOCK")
            .args(["clone", "--quiet", url])
            .arg(repo.path.display().to_string())
            .run()?;
        if !out.success() {
            bail!(Error::UnreachableRemote {
                url: url.to_string(),
                detail: out.stderr.trim().to_string(),
            });
        }
        return Ok(repo);
    }

    if repo.is_dirty()? && !force {
        bail!(Error::DirtyWorktree(repo.path.display().to_string()));
    }
    repo.git().args(["fetch", "--quiet", "origin"]).run_ok()?;
    let fetched = repo
        .git()
        .args(["rev-parse", "--verify", "--quiet", "FETCH_HEAD"])
        .run()?;
    if fetched.success() {
        repo.git()
            .args(["reset", "--hard", "--quiet", "FETCH_HEAD"])
            .run_ok()?;
    }
    Ok(repo)
}

impl CatalogRepo {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn git(&self) -> Invocation {
        Invocation::new(self.git_bin.as_str())
            .current_dir(&self.path)
            .passthrough("SSH_AUTH_SOCK")
    }

    fn is_dirty(&self) -> Result<bool> {
        let out = self.git().args(["status", "--porcelain"]).run_ok()?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Replace `manifests/` with the compiled output of every instance.
    /// Secret references are written directly to `catalog/refs/` by the
    /// reference manager.
    pub fn update_contents(&self, workdir: &Workdir, instances: &[String]) -> Result<()> {
        let manifests = self.path.join("manifests");
        if manifests.exists() {
            std::fs::remove_dir_all(&manifests)
                .with_context(|| format!("failed to clear {}", manifests.display()))?;
        }
        std::fs::create_dir_all(&manifests)
            .with_context(|| format!("failed to create {}", manifests.display()))?;

        for instance in instances {
            let compiled = workdir.compiled().join(instance);
            if compiled.is_dir() {
                copy_tree(&compiled, &manifests.join(instance))?;
            }
        }
        Ok(())
    }

    /// Stage everything and compute the (optionally migration-filtered)
    /// diff. Returns the diff to show and whether a material change
    /// remains.
    pub fn diff(&self, migration: Option<Migration>) -> Result<(String, bool)> {
        self.git().args(["add", "-A"]).run_ok()?;
        let out = self.git().args(["diff", "--cached"]).run_ok()?;
        let raw = out.stdout;
        if raw.trim().is_empty() {
            return Ok((String::new(), false));
        }

        let Some(migration) = migration else {
            return Ok((raw, true));
        };

        let mut shown = String::new();
        let mut material = false;
        for file in split_diff(&raw) {
            let old = self.show_head(&file.path);
            let new = std::fs::read_to_string(self.path.join(&file.path)).ok();
            let noise = match (old, new) {
                (Some(old), Some(new)) => is_noise(migration, &old, &new),
                // Added or deleted files are always material.
                _ => false,
            };
            if !noise {
                shown.push_str(&file.text);
                material = true;
            }
        }
        Ok((shown, material))
    }

    fn show_head(&self, path: &str) -> Option<String> {
        let out = self
            .git()
            .args(["show", &format!("HEAD:{path}")])
            .run()
            .ok()?;
        out.success().then_some(out.stdout)
    }

    /// Commit staged changes with the configured author identity.
    /// Returns false when there is nothing to commit.
    pub fn commit(&self, message: &str, username: &str, usermail: &str) -> Result<bool> {
        let staged = self.git().args(["diff", "--cached", "--quiet"]).run()?;
        if staged.success() {
            return Ok(false);
        }
        self.git()
            .args([
                "-c",
                &format!("user.name={username}"),
                "-c",
                &format!("user.email={usermail}"),
                "commit",
                "--quiet",
                "-m",
                message,
            ])
            .run_ok()?;
        Ok(true)
    }

    /// Push the catalog branch. The working copy is preserved on failure.
    pub fn push(&self) -> Result<()> {
        let out = self.git().args(["push", "origin", "HEAD"]).run()?;
        if !out.success() {
            bail!(Error::CatalogPush(out.stderr.trim().to_string()));
        }
        Ok(())
    }
}
