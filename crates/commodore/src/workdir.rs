use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The compile working directory.
///
/// A single compile assumes exclusive ownership of everything below the
/// root; concurrent compiles must not share one.
///
/// ```text
/// <root>/
///   inventory/classes/          reclass classes (seeded and symlinked)
///   inventory/targets/          one target document per instance
///   dependencies/
///     .repos/<host>/<path>.git  bare clones
///     <dep-name>/               worktrees
///     lib/                      aggregated component libraries
///   compiled/<instance>/...     engine output
///   catalog/
///     manifests/<instance>/...  committed output
///     refs/<keypath>            secret references
/// ```
#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inventory(&self) -> PathBuf {
        self.root.join("inventory")
    }

    pub fn classes(&self) -> PathBuf {
        self.root.join("inventory/classes")
    }

    pub fn targets(&self) -> PathBuf {
        self.root.join("inventory/targets")
    }

    pub fn dependencies(&self) -> PathBuf {
        self.root.join("dependencies")
    }

    pub fn repos(&self) -> PathBuf {
        self.root.join("dependencies/.repos")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("dependencies/lib")
    }

    pub fn compiled(&self) -> PathBuf {
        self.root.join("compiled")
    }

    pub fn catalog(&self) -> PathBuf {
        self.root.join("catalog")
    }

    pub fn manifests(&self) -> PathBuf {
        self.root.join("catalog/manifests")
    }

    pub fn refs(&self) -> PathBuf {
        self.root.join("catalog/refs")
    }

    /// Path of the kustomize wrapper script injected as
    /// `_kustomize_wrapper` into every target.
    pub fn kustomize_wrapper(&self) -> PathBuf {
        self.root.join("dependencies/lib/kustomize-wrapper.sh")
    }

    /// Create the directory skeleton a compile relies on.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.classes(),
            self.targets(),
            self.repos(),
            self.lib_dir(),
            self.compiled(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Remove all compile state (`catalog clean`).
    pub fn clean(&self) -> Result<()> {
        for dir in [
            self.inventory(),
            self.dependencies(),
            self.compiled(),
            self.catalog(),
        ] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

/// Replace `link` with a symlink to `target`.
pub fn force_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(link)
            .with_context(|| format!("failed to replace {}", link.display()))?,
        Ok(_) => std::fs::remove_file(link)
            .with_context(|| format!("failed to replace {}", link.display()))?,
        Err(_) => {}
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to link {} -> {}", link.display(), target.display()))
}

/// Recursively copy a directory tree.
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to).with_context(|| format!("failed to create {}", to.display()))?;
    for entry in walkdir::WalkDir::new(from).follow_links(true) {
        let entry = entry.with_context(|| format!("failed to walk {}", from.display()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .expect("walkdir stays under its root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)
                .with_context(|| format!("failed to create {}", dest.display()))?;
        } else {
            std::fs::copy(entry.path(), &dest).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), dest.display())
            })?;
        }
    }
    Ok(())
}
