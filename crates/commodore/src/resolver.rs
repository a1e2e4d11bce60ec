use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use commodore_inventory::{ClassStore, Rendered, Value, render_classes};
use commodore_process::{Invocation, jb_program};
use walkdir::WalkDir;

use crate::Reporter;
use crate::config::Config;
use crate::error::Error;
use crate::gitcache::{RepoCache, Worktree};
use crate::libs;
use crate::model::{
    Cluster, Component, ComponentInstance, ComponentMetadata, DependencyCommon, Package,
    RepoHandle, RepoPin, Tenant, param_key,
};
use crate::workdir::{Workdir, force_symlink};

/// Directory names under `inventory/classes/` that dependencies must not
/// shadow.
const RESERVED_CLASS_DIRS: &[&str] = &["params", "global", "defaults", "components"];

/// Worktree name of the configurable `kube.libsonnet` baseline repo.
const BASELINE_WORKTREE: &str = "kube-libsonnet";

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub global_revision_override: Option<String>,
    pub tenant_revision_override: Option<String>,
}

/// Everything the resolver discovered and materialized for one compile.
#[derive(Debug)]
pub struct Resolution {
    pub cluster: Cluster,
    pub tenant: Tenant,
    /// Final hierarchy seed list (component classes are per-target and
    /// not part of it).
    pub seeds: Vec<String>,
    /// Hierarchy rendered from [`Resolution::seeds`].
    pub rendered: Rendered,
    pub packages: BTreeMap<String, Package>,
    pub components: BTreeMap<String, Component>,
    /// One entry per component instance, in `applications` order.
    pub instances: Vec<ComponentInstance>,
    pub global_pin: RepoPin,
    pub tenant_pin: RepoPin,
    pub package_pins: BTreeMap<String, RepoPin>,
    pub instance_pins: BTreeMap<String, RepoPin>,
    /// Deprecation notices, emitted at the end of the compile.
    pub warnings: Vec<String>,
}

/// Discover and materialize all dependencies of a cluster.
///
/// Packages reach a fixed point first: the hierarchy is re-rendered with
/// every known package class until the `applications` list stops growing.
/// Components are fetched afterwards, their defaults enter the hierarchy,
/// and instances (aliases, multi-version pins) are validated against the
/// component metadata.
pub fn resolve(
    workdir: &Workdir,
    cfg: &Config,
    cache: &RepoCache,
    cluster: Cluster,
    tenant: Tenant,
    opts: &ResolveOptions,
    reporter: &mut dyn Reporter,
) -> Result<Resolution> {
    cluster.check_facts()?;
    workdir.ensure_layout()?;
    let store = ClassStore::new(workdir.classes());

    write_cluster_class(&store, &cluster, &tenant)?;

    reporter.info("fetching global and tenant configuration...");
    let (global_handle, global_wt) = fetch_global(cfg, cache, &tenant, opts)?;
    link_class_dir(workdir, "global", &content_dir(&global_wt, &global_handle))?;

    let (tenant_handle, tenant_wt) = fetch_tenant(cache, &cluster, &tenant, opts)?;
    if RESERVED_CLASS_DIRS.contains(&tenant.id.as_str()) {
        bail!(Error::Config(format!(
            "tenant id `{}` collides with a reserved inventory directory",
            tenant.id
        )));
    }
    link_class_dir(workdir, &tenant.id, &content_dir(&tenant_wt, &tenant_handle))?;

    if let Some(baseline) = &cfg.baseline_lib_repo {
        let handle = RepoHandle::new(baseline.clone(), cfg.baseline_lib_revision.clone());
        let wt = cache.ensure_worktree(&handle, BASELINE_WORKTREE)?;
        force_symlink(
            &wt.path.join("kube.libsonnet"),
            &workdir.lib_dir().join("kube.libsonnet"),
        )?;
    }

    let target_class = format!("{}.{}", tenant.id, cluster.id);

    // Package fixed point: every iteration may surface new `pkg.` entries
    // in `applications`; the loop is bounded because the known set only
    // grows and each iteration must grow it to continue.
    reporter.info("discovering configuration packages...");
    let mut packages: BTreeMap<String, Package> = BTreeMap::new();
    let mut package_pins: BTreeMap<String, RepoPin> = BTreeMap::new();
    let mut pkg_classes: Vec<String> = Vec::new();
    let mut rendered = loop {
        let seeds = assemble_seeds(&[], &pkg_classes, &target_class);
        let rendered = render_classes(&store, &seeds).map_err(Error::Render)?;

        let new_pkgs: Vec<String> = rendered
            .applications
            .iter()
            .filter_map(|app| app.strip_prefix("pkg."))
            .filter(|name| !packages.contains_key(*name))
            .map(str::to_string)
            .collect();
        if new_pkgs.is_empty() {
            break rendered;
        }

        let mut jobs = Vec::new();
        for name in &new_pkgs {
            if RESERVED_CLASS_DIRS.contains(&name.as_str()) || *name == tenant.id {
                bail!(Error::Config(format!(
                    "package name `{name}` collides with a reserved inventory directory"
                )));
            }
            let handle = dependency_config(&rendered.parameters, "packages", name)?;
            jobs.push((format!("pkg.{name}"), handle));
        }

        reporter.info(&format!("fetching packages: {}", new_pkgs.join(", ")));
        let mut worktrees = fetch_parallel(cache, jobs, cfg.parallelism)?;
        for name in &new_pkgs {
            let handle = dependency_config(&rendered.parameters, "packages", name)?;
            let wt = worktrees
                .remove(&format!("pkg.{name}"))
                .expect("fetch_parallel returns every job");
            let content = content_dir(&wt, &handle);
            link_class_dir(workdir, name, &content)?;
            let classes = package_class_names(name, &content)?;
            if classes.is_empty() {
                bail!(Error::Config(format!(
                    "package `{name}` does not contain any class files"
                )));
            }
            pkg_classes.extend(classes.iter().cloned());
            package_pins.insert(name.clone(), pin(&handle, &wt));
            packages.insert(
                name.clone(),
                Package {
                    common: DependencyCommon {
                        name: name.clone(),
                        repo: handle,
                        checkout: wt.path.clone(),
                    },
                    classes,
                },
            );
        }
    };

    // Component instances, `<comp> as <alias>`; plain entries synthesize
    // their identity instance.
    let mut instances: Vec<ComponentInstance> = Vec::new();
    let mut seen_aliases: BTreeSet<String> = BTreeSet::new();
    for entry in rendered
        .applications
        .iter()
        .filter(|app| !app.starts_with("pkg."))
    {
        let (component, alias) = parse_instance(entry)?;
        if !seen_aliases.insert(alias.clone()) {
            bail!(Error::DuplicateInstance(alias));
        }
        instances.push(ComponentInstance {
            instance_name: alias,
            component: component.clone(),
            override_repo: None,
            checkout: workdir.dependencies().join(&component),
        });
    }

    let component_names: BTreeSet<String> =
        instances.iter().map(|i| i.component.clone()).collect();

    reporter.info(&format!(
        "fetching {} component(s)...",
        component_names.len()
    ));
    let mut jobs = Vec::new();
    for name in &component_names {
        let handle = dependency_config(&rendered.parameters, "components", name)?;
        jobs.push((name.clone(), handle));
    }
    let worktrees = fetch_parallel(cache, jobs, cfg.parallelism)?;

    let mut components: BTreeMap<String, Component> = BTreeMap::new();
    for name in &component_names {
        let handle = dependency_config(&rendered.parameters, "components", name)?;
        let wt = &worktrees[name];
        let content = content_dir(wt, &handle);
        link_component_classes(workdir, name, &content)?;
        components.insert(
            name.clone(),
            Component {
                common: DependencyCommon {
                    name: name.clone(),
                    repo: handle,
                    checkout: wt.path.clone(),
                },
                metadata: ComponentMetadata::default(),
            },
        );
    }

    // Re-render with every component's defaults in place, then read the
    // (constant) component metadata out of the merged tree.
    let defaults: Vec<String> = component_names
        .iter()
        .map(|name| format!("defaults.{name}"))
        .collect();
    let seeds = assemble_seeds(&defaults, &pkg_classes, &target_class);
    rendered = render_classes(&store, &seeds).map_err(Error::Render)?;

    for (name, component) in &mut components {
        component.metadata = component_metadata(&rendered.parameters, name)?;
    }

    // Alias and multi-version validation against the component metadata.
    let mut version_jobs = Vec::new();
    for instance in &instances {
        let component = &components[&instance.component];
        if instance.instance_name != instance.component
            && !component.metadata.multi_instance
        {
            bail!(Error::InstancingNotSupported {
                component: instance.component.clone(),
                alias: instance.instance_name.clone(),
            });
        }

        if instance.instance_name != instance.component {
            if let Some(override_handle) =
                instance_override(&rendered.parameters, component, &instance.instance_name)
            {
                if !component.metadata.multi_version {
                    bail!(Error::Config(format!(
                        "component `{}` does not support multi-version instances \
                         (version override for `{}`)",
                        instance.component, instance.instance_name
                    )));
                }
                version_jobs.push((instance.instance_name.clone(), override_handle));
            }
        }
    }
    let version_worktrees = fetch_parallel(cache, version_jobs.clone(), cfg.parallelism)?;
    let overrides: BTreeMap<String, RepoHandle> = version_jobs.into_iter().collect();
    for instance in &mut instances {
        if let Some(handle) = overrides.get(&instance.instance_name) {
            instance.override_repo = Some(handle.clone());
            instance.checkout = version_worktrees[&instance.instance_name].path.clone();
        }
    }

    // Jsonnet dependencies per checkout, with the baseline shadow applied
    // after every vendor refresh.
    for component in components.values() {
        install_jsonnet_deps(&component.content_dir(), workdir, reporter)?;
    }
    for instance in &instances {
        if let Some(handle) = &instance.override_repo {
            let content = match &handle.subpath {
                Some(sub) => instance.checkout.join(sub),
                None => instance.checkout.clone(),
            };
            install_jsonnet_deps(&content, workdir, reporter)?;
        }
    }

    libs::deploy_libraries(&components, &workdir.lib_dir())?;

    let warnings = deprecation_warnings(&components);

    let mut instance_pins = BTreeMap::new();
    for instance in &instances {
        let component = &components[&instance.component];
        let handle = instance
            .override_repo
            .as_ref()
            .unwrap_or(&component.common.repo);
        let sha = cache.head_commit(&instance.checkout)?;
        instance_pins.insert(
            instance.instance_name.clone(),
            RepoPin {
                url: handle.url.clone(),
                version: handle.revision.clone(),
                subpath: handle.subpath.clone(),
                commit_sha: sha,
            },
        );
    }

    Ok(Resolution {
        global_pin: pin(&global_handle, &global_wt),
        tenant_pin: pin(&tenant_handle, &tenant_wt),
        cluster,
        tenant,
        seeds,
        rendered,
        packages,
        components,
        instances,
        package_pins,
        instance_pins,
        warnings,
    })
}

/// Seed order encodes precedence: the synthesized cluster class is
/// lowest, then component defaults, the global layer, package classes,
/// and the tenant's cluster target highest.
fn assemble_seeds(defaults: &[String], pkg_classes: &[String], target: &str) -> Vec<String> {
    let mut seeds = vec!["params.cluster".to_string()];
    seeds.extend(defaults.iter().cloned());
    seeds.push("global.commodore".to_string());
    seeds.extend(pkg_classes.iter().cloned());
    seeds.push(target.to_string());
    seeds
}

/// Synthesize the reserved `params.cluster` class from the descriptor.
fn write_cluster_class(store: &ClassStore, cluster: &Cluster, tenant: &Tenant) -> Result<()> {
    let doc = serde_json::json!({
        "cluster": {
            "name": cluster.id,
            "display_name": cluster.display_name.clone().unwrap_or_else(|| cluster.id.clone()),
            "tenant": cluster.tenant,
            "tenant_display_name": tenant.display_name.clone().unwrap_or_else(|| tenant.id.clone()),
            "catalog_url": cluster.catalog_url.clone().unwrap_or_default(),
        },
        "facts": cluster.facts,
        "dynamic_facts": cluster.dynamic_facts,
    });
    let yaml = serde_yaml::to_value(&doc).context("failed to build cluster class")?;
    store
        .write_class("params.cluster", &[], &Value::from_yaml(&yaml))
        .map_err(|e| Error::Render(e).into())
}

fn fetch_global(
    cfg: &Config,
    cache: &RepoCache,
    tenant: &Tenant,
    opts: &ResolveOptions,
) -> Result<(RepoHandle, Worktree)> {
    let url = tenant
        .global_git_repo_url
        .clone()
        .or_else(|| cfg.global_repo_url.clone())
        .ok_or_else(|| {
            Error::Config(format!(
                "tenant `{}` does not advertise a global defaults repository",
                tenant.id
            ))
        })?;
    let revision = opts
        .global_revision_override
        .clone()
        .or_else(|| tenant.global_git_repo_revision.clone());
    let handle = RepoHandle::new(url, revision);
    let wt = cache.ensure_worktree(&handle, "global")?;
    Ok((handle, wt))
}

fn fetch_tenant(
    cache: &RepoCache,
    cluster: &Cluster,
    tenant: &Tenant,
    opts: &ResolveOptions,
) -> Result<(RepoHandle, Worktree)> {
    let cluster_repo = cluster.git_repo.as_ref();
    let url = cluster_repo
        .and_then(|r| r.url.clone())
        .or_else(|| tenant.git_repo.as_ref().and_then(|r| r.url.clone()))
        .ok_or_else(|| {
            Error::Config(format!(
                "tenant `{}` does not advertise a configuration repository",
                tenant.id
            ))
        })?;
    let revision = opts
        .tenant_revision_override
        .clone()
        .or_else(|| cluster_repo.and_then(|r| r.revision.clone()));
    let handle = RepoHandle::new(url, revision);
    let wt = cache.ensure_worktree(&handle, "tenant")?;
    Ok((handle, wt))
}

fn content_dir(wt: &Worktree, handle: &RepoHandle) -> std::path::PathBuf {
    match &handle.subpath {
        Some(sub) => wt.path.join(sub),
        None => wt.path.clone(),
    }
}

fn pin(handle: &RepoHandle, wt: &Worktree) -> RepoPin {
    RepoPin {
        url: handle.url.clone(),
        version: handle.revision.clone(),
        subpath: handle.subpath.clone(),
        commit_sha: wt.commit.clone(),
    }
}

/// Symlink a dependency's class directory into `inventory/classes/<name>`.
fn link_class_dir(workdir: &Workdir, name: &str, content: &Path) -> Result<()> {
    force_symlink(content, &workdir.classes().join(name))
}

/// Wire a component's class files into the hierarchy: defaults before the
/// global layer, the component class via the target.
fn link_component_classes(workdir: &Workdir, name: &str, content: &Path) -> Result<()> {
    let defaults = content.join("class/defaults.yml");
    if !defaults.is_file() {
        bail!(Error::Config(format!(
            "component `{name}` has no `class/defaults.yml`"
        )));
    }
    let component_class = content.join(format!("class/{name}.yml"));
    if !component_class.is_file() {
        bail!(Error::Config(format!(
            "component `{name}` has no `class/{name}.yml`"
        )));
    }
    force_symlink(
        &defaults,
        &workdir.classes().join(format!("defaults/{name}.yml")),
    )?;
    force_symlink(
        &component_class,
        &workdir.classes().join(format!("components/{name}.yml")),
    )
}

/// Look up `parameters.<section>.<name>` and turn it into a repository
/// handle, with the typo protection the inventory format calls for.
fn dependency_config(parameters: &Value, section: &str, name: &str) -> Result<RepoHandle> {
    let entry = parameters
        .lookup(&[section, name])
        .ok_or_else(|| Error::UnknownDependency(name.to_string()))?;

    let url = entry.get("url").and_then(Value::as_str);
    let version = entry.get("version").and_then(Value::as_str);
    let subpath = entry.get("path").and_then(Value::as_str);

    match (url, version) {
        (Some(url), Some(version)) => Ok(RepoHandle {
            url: url.to_string(),
            revision: Some(version.to_string()),
            subpath: subpath.map(str::to_string),
        }),
        (None, Some(_)) => bail!(Error::AmbiguousVersionOverride(name.to_string())),
        (Some(_), None) => bail!(Error::Config(format!(
            "`{section}.{name}` has no `version`; dependencies must be pinned"
        ))),
        (None, None) => bail!(Error::Config(format!(
            "`{section}.{name}` has neither `url` nor `version`"
        ))),
    }
}

/// Parse an `applications` entry: `<component>[ as <alias>]`. Plain
/// entries normalize to their identity instance.
fn parse_instance(entry: &str) -> Result<(String, String)> {
    let (component, alias) = match entry.split_once(" as ") {
        Some((component, alias)) => (component.trim(), alias.trim()),
        None => (entry.trim(), entry.trim()),
    };
    if component.is_empty()
        || alias.is_empty()
        || component.contains(char::is_whitespace)
        || alias.contains(char::is_whitespace)
    {
        bail!(Error::Config(format!(
            "invalid `applications` entry `{entry}`; expected `<component>[ as <alias>]`"
        )));
    }
    Ok((component.to_string(), alias.to_string()))
}

/// Class names a package exposes: `<pkg>.<relative-path>`, dots for
/// directory separators, in sorted order.
fn package_class_names(name: &str, content: &Path) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for entry in WalkDir::new(content)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry.with_context(|| format!("failed to walk {}", content.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(content)
            .expect("walkdir stays under its root");
        if rel.extension().and_then(|e| e.to_str()) != Some("yml") {
            continue;
        }
        let stem = rel.with_extension("");
        let mut class = name.to_string();
        for part in stem.components() {
            class.push('.');
            class.push_str(&part.as_os_str().to_string_lossy());
        }
        classes.push(class);
    }
    Ok(classes)
}

/// Read `<component>._metadata` from the rendered hierarchy.
fn component_metadata(parameters: &Value, name: &str) -> Result<ComponentMetadata> {
    match parameters.lookup(&[param_key(name).as_str(), "_metadata"]) {
        None => Ok(ComponentMetadata::default()),
        Some(value) => serde_json::from_value(value.to_json()).with_context(|| {
            format!("invalid `_metadata` for component `{name}`")
        }),
    }
}

/// Version override for an aliased instance, if the inventory pins one.
fn instance_override(
    parameters: &Value,
    component: &Component,
    alias: &str,
) -> Option<RepoHandle> {
    let entry = parameters.lookup(&["components", alias])?;
    let url = entry.get("url").and_then(Value::as_str);
    let version = entry.get("version").and_then(Value::as_str);
    let subpath = entry.get("path").and_then(Value::as_str);
    if url.is_none() && version.is_none() {
        return None;
    }
    let base = &component.common.repo;
    Some(RepoHandle {
        url: url.map(str::to_string).unwrap_or_else(|| base.url.clone()),
        revision: version.map(str::to_string).or_else(|| base.revision.clone()),
        subpath: subpath.map(str::to_string).or_else(|| base.subpath.clone()),
    })
}

/// Run `jb install` when the checkout ships a jsonnetfile, then re-apply
/// the baseline shadow over whatever landed in `vendor/`.
fn install_jsonnet_deps(
    content: &Path,
    workdir: &Workdir,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let has_jsonnetfile =
        content.join("jsonnetfile.json").is_file() || content.join("jsonnetfile.jsonnet").is_file();
    if !has_jsonnetfile {
        return Ok(());
    }

    reporter.info(&format!(
        "installing jsonnet dependencies in {}",
        content.display()
    ));
    Invocation::new(jb_program())
        .args(["install"])
        .current_dir(content)
        .run_ok()
        .with_context(|| format!("jb install failed in {}", content.display()))?;

    let baseline = workdir.lib_dir().join("kube.libsonnet");
    let vendored = content.join("vendor/kube.libsonnet");
    if baseline.exists() && vendored.exists() {
        force_symlink(&baseline, &vendored)?;
    }
    Ok(())
}

fn deprecation_warnings(components: &BTreeMap<String, Component>) -> Vec<String> {
    let mut warnings = Vec::new();
    for (name, component) in components {
        if component.metadata.deprecated {
            let mut msg = format!("component `{name}` is deprecated");
            if let Some(successor) = &component.metadata.replaced_by {
                msg.push_str(&format!("; replaced by `{successor}`"));
            }
            if let Some(notice) = &component.metadata.deprecation_notice {
                msg.push_str(&format!(" ({notice})"));
            }
            warnings.push(msg);
        }
    }
    warnings
}

/// Materialize a batch of worktrees, bounded by `parallelism`. The cache
/// serializes fetches per remote and checkouts per worktree name; the job
/// queue and result map are only locked momentarily.
fn fetch_parallel(
    cache: &RepoCache,
    jobs: Vec<(String, RepoHandle)>,
    parallelism: usize,
) -> Result<BTreeMap<String, Worktree>> {
    if jobs.is_empty() {
        return Ok(BTreeMap::new());
    }

    let workers = parallelism.clamp(1, jobs.len());
    let queue: Mutex<VecDeque<(String, RepoHandle)>> = Mutex::new(jobs.into());
    let results: Mutex<BTreeMap<String, Worktree>> = Mutex::new(BTreeMap::new());
    let failures: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let job = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    let Some((name, handle)) = job else {
                        break;
                    };
                    match cache.ensure_worktree(&handle, &name) {
                        Ok(wt) => {
                            results
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(name, wt);
                        }
                        Err(err) => {
                            failures
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(err);
                        }
                    }
                }
            });
        }
    });

    let mut failures = failures.into_inner().unwrap_or_else(|e| e.into_inner());
    if !failures.is_empty() {
        return Err(failures.remove(0));
    }
    Ok(results.into_inner().unwrap_or_else(|e| e.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_instance_normalizes_identity() {
        assert_eq!(
            parse_instance("nfs").expect("parse"),
            ("nfs".to_string(), "nfs".to_string())
        );
        assert_eq!(
            parse_instance("nfs as nfs-a").expect("parse"),
            ("nfs".to_string(), "nfs-a".to_string())
        );
    }

    #[test]
    fn parse_instance_rejects_garbage() {
        assert!(parse_instance("nfs as ").is_err());
        assert!(parse_instance(" as nfs").is_err());
        assert!(parse_instance("a b c").is_err());
    }

    fn params(yaml: &str) -> Value {
        Value::from_yaml(&serde_yaml::from_str(yaml).expect("yaml"))
    }

    #[test]
    fn dependency_config_requires_an_entry() {
        let p = params("components: {}");
        let err = dependency_config(&p, "components", "c1").expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownDependency(_))
        ));
    }

    #[test]
    fn version_without_url_is_ambiguous() {
        let p = params("components: {c1: {version: v1.0.0}}");
        let err = dependency_config(&p, "components", "c1").expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::AmbiguousVersionOverride(_))
        ));
    }

    #[test]
    fn url_without_version_is_a_config_error() {
        let p = params("components: {c1: {url: https://git.example.com/c1.git}}");
        let err = dependency_config(&p, "components", "c1").expect_err("must fail");
        assert!(format!("{err:#}").contains("version"));
    }

    #[test]
    fn dependency_config_reads_subpath() {
        let p = params(
            "packages:\n  p1:\n    url: https://git.example.com/p1.git\n    version: main\n    path: classes\n",
        );
        let handle = dependency_config(&p, "packages", "p1").expect("handle");
        assert_eq!(handle.subpath.as_deref(), Some("classes"));
        assert_eq!(handle.revision.as_deref(), Some("main"));
    }

    #[test]
    fn seed_order_encodes_precedence() {
        let seeds = assemble_seeds(
            &["defaults.c1".to_string()],
            &["p1.common".to_string()],
            "t-tenant.c-cluster",
        );
        assert_eq!(
            seeds,
            vec![
                "params.cluster".to_string(),
                "defaults.c1".to_string(),
                "global.commodore".to_string(),
                "p1.common".to_string(),
                "t-tenant.c-cluster".to_string(),
            ]
        );
    }

    #[test]
    fn metadata_reads_from_snake_cased_key() {
        let p = params("nfs_server: {_metadata: {multi_instance: true}}");
        let meta = component_metadata(&p, "nfs-server").expect("meta");
        assert!(meta.multi_instance);
        let meta = component_metadata(&p, "other").expect("meta");
        assert!(!meta.multi_instance);
    }

    #[test]
    fn instance_override_inherits_base_fields() {
        let base = Component {
            common: DependencyCommon {
                name: "nfs".to_string(),
                repo: RepoHandle {
                    url: "https://git.example.com/nfs.git".to_string(),
                    revision: Some("v1.0.0".to_string()),
                    subpath: None,
                },
                checkout: "/work/dependencies/nfs".into(),
            },
            metadata: ComponentMetadata::default(),
        };

        let p = params("components: {nfs-b: {version: v1.1.0}}");
        let handle = instance_override(&p, &base, "nfs-b").expect("override");
        assert_eq!(handle.url, "https://git.example.com/nfs.git");
        assert_eq!(handle.revision.as_deref(), Some("v1.1.0"));

        let p = params("components: {nfs-b: {}}");
        assert!(instance_override(&p, &base, "nfs-b").is_none());
        assert!(instance_override(&params("{}"), &base, "nfs-b").is_none());
    }
}
