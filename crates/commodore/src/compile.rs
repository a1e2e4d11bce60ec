use std::io::BufRead;

use anyhow::{Context, Result, bail};
use chrono::Utc;

use crate::Reporter;
use crate::api::ApiClient;
use crate::catalog;
use crate::config::Config;
use crate::diff::Migration;
use crate::engine::{EngineDriver, write_targets};
use crate::error::Error;
use crate::gitcache::RepoCache;
use crate::model::CompileMeta;
use crate::postprocess;
use crate::resolver::{self, ResolveOptions};
use crate::secretrefs;
use crate::target::{build_targets, check_unique_instances};
use crate::workdir::Workdir;

/// Options of one `catalog compile` invocation.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Push the catalog after a successful compile.
    pub push: bool,
    /// Show the diff and ask before pushing.
    pub interactive: bool,
    /// Discard local modifications in dependency worktrees and the
    /// catalog checkout.
    pub force: bool,
    /// Override the configured fetch parallelism.
    pub parallelism: Option<usize>,
    /// Diff-noise suppression mode.
    pub migration: Option<Migration>,
    pub global_revision_override: Option<String>,
    pub tenant_revision_override: Option<String>,
}

impl CompileOptions {
    fn has_revision_override(&self) -> bool {
        self.global_revision_override.is_some() || self.tenant_revision_override.is_some()
    }
}

/// Outcome of a compile, for the CLI to print.
#[derive(Debug)]
pub struct CompileSummary {
    pub cluster_id: String,
    pub targets: Vec<String>,
    /// Migration-filtered diff to show.
    pub diff: String,
    pub material_change: bool,
    pub committed: bool,
    pub pushed: bool,
    pub meta: CompileMeta,
    pub warnings: Vec<String>,
}

/// Compile one cluster's catalog.
///
/// Stage order is fixed: metadata, dependency resolution, targets, the
/// engine, postprocessing, secret references, and only then the catalog
/// commit. Deprecation warnings are collected along the way and emitted
/// before the push decision.
pub fn compile(
    workdir: &Workdir,
    cfg: &Config,
    opts: &CompileOptions,
    cluster_id: &str,
    reporter: &mut dyn Reporter,
) -> Result<CompileSummary> {
    // Refusal rule: a catalog compiled from unofficial sources must never
    // be pushed. Checked before anything is fetched.
    if opts.push && opts.has_revision_override() {
        bail!(Error::Config(
            "cannot combine --push with a revision override; drop one of them".to_string()
        ));
    }

    let api_url = cfg.api_url.as_deref().ok_or_else(|| {
        Error::Config("no Lieutenant API URL configured (COMMODORE_API_URL)".to_string())
    })?;
    let api = ApiClient::new(api_url, cfg.api_token.clone(), cfg.api_timeout)?;

    reporter.info(&format!("fetching cluster metadata for `{cluster_id}`..."));
    let cluster = api.cluster(cluster_id)?;
    let tenant = api.tenant(&cluster.tenant)?;
    let catalog_url = cluster.catalog_url.clone().ok_or_else(|| {
        Error::Config(format!("cluster `{cluster_id}` has no catalog repository"))
    })?;

    let cache = RepoCache::new(workdir, opts.force);
    let resolve_opts = ResolveOptions {
        global_revision_override: opts.global_revision_override.clone(),
        tenant_revision_override: opts.tenant_revision_override.clone(),
    };
    let mut effective_cfg = cfg.clone();
    if let Some(parallelism) = opts.parallelism {
        effective_cfg.parallelism = parallelism.max(1);
    }

    let resolution = resolver::resolve(
        workdir,
        &effective_cfg,
        &cache,
        cluster,
        tenant,
        &resolve_opts,
        reporter,
    )?;

    write_kustomize_wrapper(workdir)?;

    let targets = build_targets(workdir, &resolution)?;
    check_unique_instances(&targets)?;

    write_targets(workdir, &targets)?;
    let package_class_dirs: Vec<_> = resolution
        .packages
        .keys()
        .map(|name| workdir.classes().join(name))
        .collect();
    EngineDriver::new().run(
        workdir,
        &targets,
        &package_class_dirs,
        effective_cfg.parallelism,
        reporter,
    )?;

    postprocess::run_filters(workdir, &targets, reporter)?;

    reporter.info("updating catalog...");
    let catalog = catalog::checkout_catalog(workdir, &catalog_url, opts.force)?;
    let instance_names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
    catalog.update_contents(workdir, &instance_names)?;

    // Secret references scan parameters, never rendered manifests; the
    // union over all targets catches instance-overlay references.
    let mut refs = secretrefs::scan_parameters(&resolution.rendered.parameters);
    for target in &targets {
        refs.extend(secretrefs::scan_parameters(&target.parameters));
    }
    secretrefs::write_refs(&workdir.refs(), &resolution.rendered.parameters, &refs)?;

    let meta = CompileMeta {
        commodore_version: env!("CARGO_PKG_VERSION").to_string(),
        compile_ts: Utc::now(),
        global: resolution.global_pin.clone(),
        tenant: resolution.tenant_pin.clone(),
        packages: resolution.package_pins.clone(),
        instances: resolution.instance_pins.clone(),
    };

    let (diff, material_change) = catalog.diff(opts.migration)?;

    for warning in &resolution.warnings {
        reporter.warn(warning);
    }

    let mut committed = false;
    let mut pushed = false;
    if material_change {
        committed = catalog.commit(&meta.commit_message(), &cfg.username, &cfg.usermail)?;
        let confirmed = if opts.interactive {
            reporter.info("catalog changes:");
            reporter.info(&diff);
            confirm_push()?
        } else {
            opts.push
        };
        if confirmed {
            catalog.push()?;
            pushed = true;
            reporter.info("catalog pushed");
            if api.report_compile_meta(cluster_id, &meta).unwrap_or(false) {
                reporter.info("compile metadata reported to Lieutenant");
            }
        }
    } else {
        reporter.info("catalog unchanged");
    }

    Ok(CompileSummary {
        cluster_id: cluster_id.to_string(),
        targets: instance_names,
        diff,
        material_change,
        committed,
        pushed,
        meta,
        warnings: resolution.warnings,
    })
}

fn confirm_push() -> Result<bool> {
    eprint!("push catalog? [y/N] ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

/// The wrapper script injected as `_kustomize_wrapper` into every target.
fn write_kustomize_wrapper(workdir: &Workdir) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = workdir.kustomize_wrapper();
    if path.is_file() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, "#!/bin/sh\nset -e\nexec kustomize build \"$@\"\n")
        .with_context(|| format!("failed to write {}", path.display()))?;
    let mut perms = std::fs::metadata(&path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)
        .with_context(|| format!("failed to chmod {}", path.display()))?;
    Ok(())
}
