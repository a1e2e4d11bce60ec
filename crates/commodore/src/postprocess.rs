use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use commodore_inventory::Value;
use commodore_process::{Invocation, jsonnet_program};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::Reporter;
use crate::error::Error;
use crate::target::Target;
use crate::workdir::Workdir;

/// One postprocessing filter, as declared under
/// `parameters.commodore.postprocess.filters`.
#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    #[serde(rename = "type")]
    pub kind: FilterKind,
    /// Subpath below `compiled/<instance>/` the filter reads and writes.
    pub path: String,
    /// Builtin name, or a jsonnet file relative to the component checkout.
    pub filter: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub filterargs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Builtin,
    Jsonnet,
}

fn default_true() -> bool {
    true
}

/// Extract the declared filter pipeline from rendered parameters.
pub fn filters_from_parameters(parameters: &Value) -> Result<Vec<Filter>> {
    let Some(raw) = parameters.lookup(&["commodore", "postprocess", "filters"]) else {
        return Ok(Vec::new());
    };
    serde_json::from_value(raw.to_json())
        .context("invalid `commodore.postprocess.filters` declaration")
}

/// Run every instance's filter pipeline.
///
/// Filters within one instance run in declared order; instances are
/// independent of each other.
pub fn run_filters(
    workdir: &Workdir,
    targets: &[Target],
    reporter: &mut dyn Reporter,
) -> Result<()> {
    for target in targets {
        let instance_dir = workdir.compiled().join(&target.name);
        for filter in &target.filters {
            if !filter.enabled {
                continue;
            }
            reporter.info(&format!(
                "postprocessing `{}` with {}",
                target.name, filter.filter
            ));
            apply_filter(workdir, target, filter, &instance_dir).map_err(|err| {
                anyhow::Error::from(Error::Filter {
                    instance: target.name.clone(),
                    filter: filter.filter.clone(),
                    detail: format!("{err:#}"),
                })
            })?;
        }
    }
    Ok(())
}

fn apply_filter(
    workdir: &Workdir,
    target: &Target,
    filter: &Filter,
    instance_dir: &Path,
) -> Result<()> {
    let filter_dir = instance_dir.join(&filter.path);
    match filter.kind {
        FilterKind::Builtin => match filter.filter.as_str() {
            "helm_namespace" => helm_namespace(&filter_dir, &filter.filterargs),
            other => bail!("unknown builtin filter `{other}`"),
        },
        FilterKind::Jsonnet => run_jsonnet_filter(workdir, target, filter, &filter_dir),
    }
}

/// Builtin `helm_namespace`: patch `metadata.namespace` into every object
/// below the filter path, optionally injecting a Namespace object,
/// skipping the declared `(kind, name)` exclusions.
fn helm_namespace(dir: &Path, args: &BTreeMap<String, serde_json::Value>) -> Result<()> {
    let namespace = args
        .get("namespace")
        .and_then(|v| v.as_str())
        .context("helm_namespace requires a `namespace` argument")?;
    let create_namespace = args
        .get("create_namespace")
        .map(truthy)
        .unwrap_or(false);
    let exclude: Vec<(String, String)> = args
        .get("exclude_objects")
        .map(|v| {
            serde_json::from_value::<Vec<ExcludedObject>>(v.clone())
                .context("invalid `exclude_objects`")
        })
        .transpose()?
        .unwrap_or_default()
        .into_iter()
        .map(|e| (e.kind, e.name))
        .collect();

    for file in yaml_files(dir)? {
        let raw = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let mut docs = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(&raw) {
            let value = serde_yaml::Value::deserialize(doc)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            docs.push(value);
        }

        for doc in &mut docs {
            patch_namespace(doc, namespace, &exclude);
        }

        write_multidoc(&file, &docs)?;
    }

    if create_namespace {
        let ns: serde_yaml::Value = serde_yaml::from_str(&format!(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {namespace}\n"
        ))
        .expect("static namespace document");
        write_multidoc(&dir.join("00_namespace.yaml"), &[ns])?;
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct ExcludedObject {
    kind: String,
    name: String,
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn patch_namespace(
    doc: &mut serde_yaml::Value,
    namespace: &str,
    exclude: &[(String, String)],
) {
    let Some(map) = doc.as_mapping_mut() else {
        return;
    };
    let kind = map
        .get("kind")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let name = map
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if kind.is_empty() || exclude.iter().any(|(k, n)| *k == kind && *n == name) {
        return;
    }

    if !map.contains_key("metadata") {
        map.insert(
            serde_yaml::Value::String("metadata".to_string()),
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        );
    }
    if let Some(metadata) = map
        .get_mut("metadata")
        .and_then(serde_yaml::Value::as_mapping_mut)
    {
        metadata.insert(
            serde_yaml::Value::String("namespace".to_string()),
            serde_yaml::Value::String(namespace.to_string()),
        );
    }
}

/// Run a component-authored jsonnet filter. The filter gets the
/// Kapitan-compatible ext-var environment plus its `filterargs`, and
/// returns a `{filename: document}` map written back under the filter
/// path.
fn run_jsonnet_filter(
    workdir: &Workdir,
    target: &Target,
    filter: &Filter,
    filter_dir: &Path,
) -> Result<()> {
    let component_dir = workdir.dependencies().join(&target.name);
    let filter_file = if component_dir.join(&filter.filter).is_file() {
        component_dir.join(&filter.filter)
    } else {
        workdir
            .dependencies()
            .join(&target.component)
            .join(&filter.filter)
    };
    if !filter_file.is_file() {
        bail!("filter file `{}` does not exist", filter_file.display());
    }

    let mut invocation = Invocation::new(jsonnet_program())
        .current_dir(workdir.root())
        .args(["-J".to_string(), workdir.lib_dir().display().to_string()])
        .args(["-J".to_string(), filter_dir.display().to_string()])
        .args(["--ext-str".to_string(), format!("target={}", target.name)])
        .args([
            "--ext-str".to_string(),
            format!("component={}", target.component),
        ]);
    for (key, value) in &filter.filterargs {
        match value {
            serde_json::Value::String(s) => {
                invocation = invocation.args(["--ext-str".to_string(), format!("{key}={s}")]);
            }
            other => {
                invocation =
                    invocation.args(["--ext-code".to_string(), format!("{key}={other}")]);
            }
        }
    }
    let out = invocation
        .arg(filter_file.display().to_string())
        .run_ok()?;

    let rendered: BTreeMap<String, serde_json::Value> = serde_json::from_str(&out.stdout)
        .context("jsonnet filter must return an object mapping filenames to documents")?;
    for (filename, document) in rendered {
        if filename.starts_with('/') || filename.split('/').any(|seg| seg == "..") {
            bail!("filter output filename `{filename}` escapes the filter path");
        }
        let path = filter_dir.join(&filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(&document)
            .with_context(|| format!("failed to serialize {filename}"))?;
        std::fs::write(&path, yaml)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if entry.file_type().is_file() {
            let ext = entry.path().extension().and_then(|e| e.to_str());
            if matches!(ext, Some("yaml") | Some("yml")) {
                files.push(entry.path().to_path_buf());
            }
        }
    }
    Ok(files)
}

fn write_multidoc(path: &Path, docs: &[serde_yaml::Value]) -> Result<()> {
    let mut out = String::new();
    for doc in docs {
        let rendered =
            serde_yaml::to_string(doc).with_context(|| format!("failed to serialize {}", path.display()))?;
        if !out.is_empty() {
            out.push_str("---\n");
        }
        out.push_str(&rendered);
    }
    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}
