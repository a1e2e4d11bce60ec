//! End-to-end dependency resolution and target building against local
//! Git repositories: identity instances, package layering, application
//! removal, aliasing and multi-version instances.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use commodore::NullReporter;
use commodore::config::Config;
use commodore::error::Error;
use commodore::gitcache::RepoCache;
use commodore::model::{Cluster, Tenant};
use commodore::resolver::{self, ResolveOptions, Resolution};
use commodore::target::{build_targets, check_unique_instances};
use commodore::workdir::Workdir;
use commodore_inventory::Value;
use commodore_process::Invocation;

struct Fixture {
    _td: TempDir,
    upstream: PathBuf,
    workdir: Workdir,
}

impl Fixture {
    fn new() -> Self {
        let td = TempDir::new().expect("tempdir");
        let upstream = td.path().join("upstream");
        std::fs::create_dir_all(&upstream).expect("mkdir");
        let workdir = Workdir::new(td.path().join("work"));
        workdir.ensure_layout().expect("layout");
        Self {
            _td: td,
            upstream,
            workdir,
        }
    }

    fn git(dir: &Path, args: &[&str]) {
        Invocation::new(commodore_process::git_program())
            .current_dir(dir)
            .args(args.iter().copied())
            .run_ok()
            .expect("git");
    }

    /// Create a repository under `upstream/<name>` from `(path, content)`
    /// pairs and commit it, optionally tagging the commit.
    fn repo(&self, name: &str, files: &[(&str, &str)], tag: Option<&str>) -> PathBuf {
        let dir = self.upstream.join(name);
        if !dir.join(".git").exists() {
            std::fs::create_dir_all(&dir).expect("mkdir");
            Self::git(&dir, &["init", "--quiet", "--initial-branch=main"]);
            Self::git(&dir, &["config", "user.name", "Fixture"]);
            Self::git(&dir, &["config", "user.email", "fixture@example.com"]);
        }
        for (path, content) in files {
            let file = dir.join(path);
            std::fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
            std::fs::write(file, content).expect("write");
        }
        Self::git(&dir, &["add", "."]);
        Self::git(&dir, &["commit", "--quiet", "--allow-empty", "-m", "fixture"]);
        if let Some(tag) = tag {
            Self::git(&dir, &["tag", tag]);
        }
        dir
    }

    /// A component repository with the standard class layout.
    fn component_repo(
        &self,
        name: &str,
        defaults_params: &str,
        tag: Option<&str>,
    ) -> PathBuf {
        let defaults = format!("parameters:\n{defaults_params}");
        let component_class = format!(
            "parameters:\n  kapitan:\n    compile:\n      - input_type: jsonnet\n        input_paths:\n          - '${{_base_directory}}/component/main.jsonnet'\n        output_path: {name}\n"
        );
        let class_path = format!("class/{name}.yml");
        self.repo(
            name,
            &[
                ("class/defaults.yml", defaults.as_str()),
                (class_path.as_str(), component_class.as_str()),
                ("component/main.jsonnet", "{}\n"),
            ],
            tag,
        )
    }

    fn cluster(&self) -> Cluster {
        serde_json::from_value(serde_json::json!({
            "id": "c-demo",
            "tenant": "t-demo",
            "facts": {"cloud": "local", "distribution": "k3s"},
        }))
        .expect("cluster")
    }

    fn tenant(&self, global: &Path, tenant_repo: &Path) -> Tenant {
        serde_json::from_value(serde_json::json!({
            "id": "t-demo",
            "gitRepo": {"url": tenant_repo.display().to_string()},
            "globalGitRepoUrl": global.display().to_string(),
        }))
        .expect("tenant")
    }

    fn resolve(&self, global: &Path, tenant_repo: &Path) -> anyhow::Result<Resolution> {
        let cfg = Config::default();
        let cache = RepoCache::new(&self.workdir, false);
        resolver::resolve(
            &self.workdir,
            &cfg,
            &cache,
            self.cluster(),
            self.tenant(global, tenant_repo),
            &ResolveOptions::default(),
            &mut NullReporter,
        )
    }
}

/// Global config repo advertising the given applications/components.
fn global_config(entries: &[(&str, &PathBuf, &str)], applications: &[&str]) -> String {
    let mut doc = String::from("parameters:\n  applications:\n");
    for app in applications {
        doc.push_str(&format!("    - {app}\n"));
    }
    if applications.is_empty() {
        doc = String::from("parameters:\n  applications: []\n");
    }
    doc.push_str("  components:\n");
    for (name, url, version) in entries {
        doc.push_str(&format!(
            "    {name}:\n      url: {}\n      version: {version}\n",
            url.display()
        ));
    }
    doc
}

#[test]
fn minimal_cluster_produces_identity_instance() {
    let fx = Fixture::new();
    let c1 = fx.component_repo("c1", "  c1:\n    namespace: syn-c1\n", Some("v1.0.0"));
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("c1", &c1, "v1.0.0")], &["c1"]),
        )],
        None,
    );
    let tenant = fx.repo("tenant", &[("c-demo.yml", "parameters: {}\n")], None);

    let resolution = fx.resolve(&global, &tenant).expect("resolve");
    assert_eq!(resolution.instances.len(), 1);
    assert_eq!(resolution.instances[0].instance_name, "c1");
    assert_eq!(resolution.instances[0].component, "c1");
    assert!(resolution.components.contains_key("c1"));

    // Defaults are wired into the hierarchy.
    assert!(
        fx.workdir
            .classes()
            .join("defaults/c1.yml")
            .symlink_metadata()
            .is_ok()
    );
    assert_eq!(
        resolution
            .rendered
            .parameters
            .lookup(&["c1", "namespace"])
            .and_then(Value::as_str),
        Some("syn-c1")
    );

    let targets = build_targets(&fx.workdir, &resolution).expect("targets");
    check_unique_instances(&targets).expect("unique");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].name, "c1");
    assert_eq!(targets[0].render_spec.len(), 1);
    // `${_base_directory}` resolves to the base component checkout.
    let input = &targets[0].render_spec[0].input_paths[0];
    assert!(
        input.ends_with("dependencies/c1/component/main.jsonnet"),
        "got: {input}"
    );
}

#[test]
fn package_layering_enables_second_component() {
    let fx = Fixture::new();
    let c1 = fx.component_repo("c1", "  c1: {}\n", Some("v1.0.0"));
    let c2 = fx.component_repo("c2", "  c2: {}\n", Some("v2.0.0"));
    let p1 = fx.repo(
        "p1",
        &[("common.yml", "parameters:\n  applications+:\n    - c2\n")],
        None,
    );
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("c1", &c1, "v1.0.0"), ("c2", &c2, "v2.0.0")], &["c1"]),
        )],
        None,
    );
    let tenant_doc = format!(
        "parameters:\n  applications+:\n    - pkg.p1\n  packages:\n    p1:\n      url: {}\n      version: main\n",
        p1.display()
    );
    let tenant = fx.repo("tenant", &[("c-demo.yml", tenant_doc.as_str())], None);

    let resolution = fx.resolve(&global, &tenant).expect("resolve");
    assert!(resolution.packages.contains_key("p1"));
    assert_eq!(resolution.packages["p1"].classes, vec!["p1.common".to_string()]);

    let mut instances: Vec<&str> = resolution
        .instances
        .iter()
        .map(|i| i.instance_name.as_str())
        .collect();
    instances.sort_unstable();
    assert_eq!(instances, vec!["c1", "c2"]);
}

#[test]
fn application_removal_yields_zero_targets() {
    let fx = Fixture::new();
    let c1 = fx.component_repo("c1", "  c1: {}\n", Some("v1.0.0"));
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("c1", &c1, "v1.0.0")], &["c1"]),
        )],
        None,
    );
    let tenant = fx.repo(
        "tenant",
        &[("c-demo.yml", "parameters:\n  applications+:\n    - ~c1\n")],
        None,
    );

    let resolution = fx.resolve(&global, &tenant).expect("resolve");
    assert!(resolution.instances.is_empty());
    let targets = build_targets(&fx.workdir, &resolution).expect("targets");
    assert!(targets.is_empty());
}

#[test]
fn instance_aliasing_builds_one_target_per_alias() {
    let fx = Fixture::new();
    let nfs = fx.component_repo(
        "nfs",
        "  nfs:\n    =_metadata:\n      multi_instance: true\n    server: x\n",
        Some("v1.0.0"),
    );
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("nfs", &nfs, "v1.0.0")], &[]),
        )],
        None,
    );
    let tenant = fx.repo(
        "tenant",
        &[(
            "c-demo.yml",
            "parameters:\n  applications:\n    - nfs as nfs-a\n    - nfs as nfs-b\n  nfs_b:\n    server: y\n",
        )],
        None,
    );

    let resolution = fx.resolve(&global, &tenant).expect("resolve");
    let targets = build_targets(&fx.workdir, &resolution).expect("targets");
    check_unique_instances(&targets).expect("unique");
    assert_eq!(targets.len(), 2);

    let by_name = |name: &str| {
        targets
            .iter()
            .find(|t| t.name == name)
            .unwrap_or_else(|| panic!("target {name} missing"))
    };
    let nfs_a = by_name("nfs-a");
    let nfs_b = by_name("nfs-b");
    assert_eq!(
        nfs_a.parameters.get("_instance").and_then(Value::as_str),
        Some("nfs-a")
    );
    assert_eq!(
        nfs_a.parameters.lookup(&["nfs", "server"]).and_then(Value::as_str),
        Some("x")
    );
    assert_eq!(
        nfs_b.parameters.lookup(&["nfs", "server"]).and_then(Value::as_str),
        Some("y")
    );
}

#[test]
fn alias_for_instance_unaware_component_fails() {
    let fx = Fixture::new();
    let c1 = fx.component_repo("c1", "  c1: {}\n", Some("v1.0.0"));
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("c1", &c1, "v1.0.0")], &[]),
        )],
        None,
    );
    let tenant = fx.repo(
        "tenant",
        &[("c-demo.yml", "parameters:\n  applications:\n    - c1 as c1-extra\n")],
        None,
    );

    let err = fx.resolve(&global, &tenant).expect_err("must fail");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InstancingNotSupported { .. })
    ));
}

#[test]
fn duplicate_alias_is_fatal() {
    let fx = Fixture::new();
    let nfs = fx.component_repo(
        "nfs",
        "  nfs:\n    =_metadata:\n      multi_instance: true\n",
        Some("v1.0.0"),
    );
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("nfs", &nfs, "v1.0.0")], &[]),
        )],
        None,
    );
    let tenant = fx.repo(
        "tenant",
        &[(
            "c-demo.yml",
            "parameters:\n  applications:\n    - nfs as nfs-a\n    - nfs as nfs-a\n",
        )],
        None,
    );

    let err = fx.resolve(&global, &tenant).expect_err("must fail");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::DuplicateInstance(_))
    ));
}

#[test]
fn multi_version_instance_gets_its_own_worktree() {
    let fx = Fixture::new();
    let nfs = fx.component_repo(
        "nfs",
        "  nfs:\n    =_metadata:\n      multi_instance: true\n      multi_version: true\n    release: one\n",
        Some("v1.0.0"),
    );
    // A second tagged revision with different content.
    fx.repo("nfs", &[("component/extra.jsonnet", "{}\n")], Some("v1.1.0"));

    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("nfs", &nfs, "v1.0.0")], &[]),
        )],
        None,
    );
    let tenant = fx.repo(
        "tenant",
        &[(
            "c-demo.yml",
            "parameters:\n  applications:\n    - nfs\n    - nfs as nfs-b\n  components:\n    nfs-b:\n      version: v1.1.0\n",
        )],
        None,
    );

    let resolution = fx.resolve(&global, &tenant).expect("resolve");
    let base = fx.workdir.dependencies().join("nfs");
    let pinned = fx.workdir.dependencies().join("nfs-b");
    assert!(base.join("component/main.jsonnet").is_file());
    assert!(!base.join("component/extra.jsonnet").exists());
    assert!(pinned.join("component/extra.jsonnet").is_file());

    // The base-directory invariant: even the pinned instance's target
    // resolves `${_base_directory}` against the base checkout.
    let targets = build_targets(&fx.workdir, &resolution).expect("targets");
    let nfs_b = targets
        .iter()
        .find(|t| t.name == "nfs-b")
        .expect("nfs-b target");
    assert_eq!(
        nfs_b.parameters.get("_base_directory").and_then(Value::as_str),
        Some(base.display().to_string().as_str())
    );

    let pin = &resolution.instance_pins["nfs-b"];
    assert_eq!(pin.version.as_deref(), Some("v1.1.0"));
    assert_ne!(pin.commit_sha, resolution.instance_pins["nfs"].commit_sha);
}

#[test]
fn version_override_without_multi_version_support_fails() {
    let fx = Fixture::new();
    let nfs = fx.component_repo(
        "nfs",
        "  nfs:\n    =_metadata:\n      multi_instance: true\n",
        Some("v1.0.0"),
    );
    fx.repo("nfs", &[("other.txt", "x\n")], Some("v1.1.0"));
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("nfs", &nfs, "v1.0.0")], &[]),
        )],
        None,
    );
    let tenant = fx.repo(
        "tenant",
        &[(
            "c-demo.yml",
            "parameters:\n  applications:\n    - nfs as nfs-b\n  components:\n    nfs-b:\n      version: v1.1.0\n",
        )],
        None,
    );

    let err = fx.resolve(&global, &tenant).expect_err("must fail");
    assert!(format!("{err:#}").contains("multi-version"));
}

#[test]
fn unknown_component_in_applications_fails() {
    let fx = Fixture::new();
    let global = fx.repo(
        "global",
        &[("commodore.yml", "parameters:\n  applications:\n    - ghost\n")],
        None,
    );
    let tenant = fx.repo("tenant", &[("c-demo.yml", "parameters: {}\n")], None);

    let err = fx.resolve(&global, &tenant).expect_err("must fail");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::UnknownDependency(_))
    ));
}

#[test]
fn second_resolve_is_idempotent() {
    let fx = Fixture::new();
    let c1 = fx.component_repo("c1", "  c1:\n    namespace: syn-c1\n", Some("v1.0.0"));
    let global = fx.repo(
        "global",
        &[(
            "commodore.yml",
            &global_config(&[("c1", &c1, "v1.0.0")], &["c1"]),
        )],
        None,
    );
    let tenant = fx.repo("tenant", &[("c-demo.yml", "parameters: {}\n")], None);

    let first = fx.resolve(&global, &tenant).expect("resolve");
    let second = fx.resolve(&global, &tenant).expect("resolve");
    assert_eq!(
        first.instance_pins["c1"].commit_sha,
        second.instance_pins["c1"].commit_sha
    );
    assert_eq!(first.seeds, second.seeds);
}
