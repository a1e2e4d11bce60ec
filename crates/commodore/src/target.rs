use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use commodore_inventory::{ClassStore, Value, render_classes_with};

use crate::error::Error;
use crate::model::param_key;
use crate::postprocess::{Filter, filters_from_parameters};
use crate::resolver::Resolution;
use crate::workdir::Workdir;

/// One unit of templating-engine work, 1:1 with a component instance.
#[derive(Debug, Clone)]
pub struct Target {
    /// Instance name; the engine writes to `compiled/<name>/`.
    pub name: String,
    /// Component the instance renders.
    pub component: String,
    /// Classes in include order, ending with the component class.
    pub classes: Vec<String>,
    /// Per-target parameter document written to `inventory/targets/`.
    pub parameters: Value,
    /// Renderer invocations transcribed from `kapitan.compile`.
    pub render_spec: Vec<RenderStep>,
    /// Postprocessing filters for this instance, in declared order.
    pub filters: Vec<Filter>,
}

/// One renderer invocation of the external engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderStep {
    pub input_type: String,
    /// Input paths relative to the instance's `_base_directory`.
    pub input_paths: Vec<String>,
    /// Output prefix below `compiled/<instance>/`.
    pub output_path: String,
}

/// Build one target per component instance.
///
/// The per-target hierarchy is the resolution's seed list plus the
/// component class, rendered with the injected instance parameters
/// (`_instance`, `_base_directory`, `_kustomize_wrapper`) overlaid so
/// references against them resolve. For aliased instances the
/// `<alias-in-snake-case>` parameter subtree deep-merges over the
/// component's own.
pub fn build_targets(workdir: &Workdir, resolution: &Resolution) -> Result<Vec<Target>> {
    let store = ClassStore::new(workdir.classes());
    let mut targets = Vec::with_capacity(resolution.instances.len());

    for instance in &resolution.instances {
        let component = &resolution.components[&instance.component];
        let component_class = format!("components.{}", instance.component);
        let mut classes = resolution.seeds.clone();
        classes.push(component_class);

        // `_base_directory` points at the base component even for
        // multi-version instances, so cross-component imports stay stable.
        let overlay = instance_overlay(workdir, instance.instance_name.as_str(), component);
        let rendered = render_classes_with(&store, &classes, Some(&overlay))
            .map_err(Error::Render)
            .with_context(|| {
                format!("failed to render target for `{}`", instance.instance_name)
            })?;

        let component_key = param_key(&instance.component);
        let mut instance_params = rendered
            .parameters
            .get(&component_key)
            .cloned()
            .unwrap_or_else(Value::empty_map);

        if instance.instance_name != instance.component {
            let alias_key = param_key(&instance.instance_name);
            if let Some(alias_params) = rendered.parameters.get(&alias_key) {
                instance_params =
                    commodore_inventory::merge(instance_params, alias_params.clone())
                        .map_err(Error::Render)?;
            }
        }

        let render_spec = render_spec(&rendered.parameters, &instance.instance_name)?;
        let filters = filters_from_parameters(&rendered.parameters)?;

        let parameters = target_parameters(
            &overlay,
            &component_key,
            instance_params,
            &instance.instance_name,
            &instance.component,
        );

        targets.push(Target {
            name: instance.instance_name.clone(),
            component: instance.component.clone(),
            classes: rendered.classes,
            parameters,
            render_spec,
            filters,
        });
    }

    Ok(targets)
}

fn instance_overlay(
    workdir: &Workdir,
    instance_name: &str,
    component: &crate::model::Component,
) -> Value {
    let mut overlay = BTreeMap::new();
    overlay.insert(
        "_instance".to_string(),
        Value::String(instance_name.to_string()),
    );
    overlay.insert(
        "_base_directory".to_string(),
        Value::String(component.content_dir().display().to_string()),
    );
    overlay.insert(
        "_kustomize_wrapper".to_string(),
        Value::String(workdir.kustomize_wrapper().display().to_string()),
    );
    Value::Map(overlay)
}

/// The document written to `inventory/targets/<instance>.yml`.
fn target_parameters(
    overlay: &Value,
    component_key: &str,
    instance_params: Value,
    instance_name: &str,
    component_name: &str,
) -> Value {
    let mut parameters = overlay.as_map().cloned().unwrap_or_default();
    parameters.insert(component_key.to_string(), instance_params);

    let mut vars = BTreeMap::new();
    vars.insert(
        "target".to_string(),
        Value::String(instance_name.to_string()),
    );
    vars.insert(
        "component".to_string(),
        Value::String(component_name.to_string()),
    );
    let mut kapitan = BTreeMap::new();
    kapitan.insert("vars".to_string(), Value::Map(vars));
    parameters.insert("kapitan".to_string(), Value::Map(kapitan));

    Value::Map(parameters)
}

/// Transcribe `kapitan.compile`, rejecting output paths that would escape
/// the instance's namespace under `compiled/`.
fn render_spec(parameters: &Value, instance: &str) -> Result<Vec<RenderStep>> {
    let Some(compile) = parameters.lookup(&["kapitan", "compile"]) else {
        return Ok(Vec::new());
    };
    let entries = compile.as_list().ok_or_else(|| {
        Error::Config(format!(
            "`kapitan.compile` for instance `{instance}` must be a list"
        ))
    })?;

    let mut steps = Vec::with_capacity(entries.len());
    for entry in entries {
        let input_type = entry
            .get("input_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Config(format!(
                    "`kapitan.compile` entry for `{instance}` has no `input_type`"
                ))
            })?
            .to_string();
        let input_paths = entry
            .get("input_paths")
            .and_then(Value::as_string_list)
            .ok_or_else(|| {
                Error::Config(format!(
                    "`kapitan.compile` entry for `{instance}` has no `input_paths`"
                ))
            })?;
        let output_path = entry
            .get("output_path")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_string();

        if output_path.starts_with('/') || output_path.split('/').any(|seg| seg == "..") {
            bail!(Error::Config(format!(
                "`kapitan.compile` entry for `{instance}` escapes its output \
                 namespace: `{output_path}`"
            )));
        }

        steps.push(RenderStep {
            input_type,
            input_paths,
            output_path,
        });
    }
    Ok(steps)
}

/// Check the instance-uniqueness invariant over a built target set.
pub fn check_unique_instances(targets: &[Target]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for target in targets {
        if !seen.insert(&target.name) {
            bail!(Error::DuplicateInstance(target.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(yaml: &str) -> Value {
        Value::from_yaml(&serde_yaml::from_str(yaml).expect("yaml"))
    }

    #[test]
    fn render_spec_transcribes_compile_entries() {
        let p = params(
            "kapitan:\n  compile:\n    - input_type: jsonnet\n      input_paths: ['${_base_directory}/component/main.jsonnet']\n      output_path: nfs\n",
        );
        let steps = render_spec(&p, "nfs").expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].input_type, "jsonnet");
        assert_eq!(steps[0].output_path, "nfs");
    }

    #[test]
    fn render_spec_defaults_output_path() {
        let p = params(
            "kapitan:\n  compile:\n    - input_type: jinja2\n      input_paths: [templates]\n",
        );
        let steps = render_spec(&p, "x").expect("steps");
        assert_eq!(steps[0].output_path, ".");
    }

    #[test]
    fn render_spec_rejects_escaping_output_paths() {
        for bad in ["/abs", "../up", "a/../../b"] {
            let doc = format!(
                "kapitan:\n  compile:\n    - input_type: jsonnet\n      input_paths: [x]\n      output_path: '{bad}'\n",
            );
            let err = render_spec(&params(&doc), "x").expect_err("must fail");
            assert!(format!("{err:#}").contains("escapes"), "{bad}");
        }
    }

    #[test]
    fn render_spec_absent_is_empty() {
        assert!(render_spec(&params("{}"), "x").expect("steps").is_empty());
    }

    #[test]
    fn duplicate_target_names_violate_the_invariant() {
        let target = |name: &str| Target {
            name: name.to_string(),
            component: "c".to_string(),
            classes: vec![],
            parameters: Value::empty_map(),
            render_spec: vec![],
            filters: vec![],
        };
        assert!(check_unique_instances(&[target("a"), target("b")]).is_ok());
        assert!(check_unique_instances(&[target("a"), target("a")]).is_err());
    }

    #[test]
    fn target_parameters_inject_instance_and_vars() {
        let overlay = params("_instance: nfs-a\n_base_directory: /work/dependencies/nfs\n_kustomize_wrapper: /work/dependencies/lib/kustomize-wrapper.sh\n");
        let doc = target_parameters(
            &overlay,
            "nfs",
            params("server: x"),
            "nfs-a",
            "nfs",
        );
        assert_eq!(
            doc.get("_instance").and_then(Value::as_str),
            Some("nfs-a")
        );
        assert_eq!(
            doc.lookup(&["nfs", "server"]).and_then(Value::as_str),
            Some("x")
        );
        assert_eq!(
            doc.lookup(&["kapitan", "vars", "target"]).and_then(Value::as_str),
            Some("nfs-a")
        );
        assert_eq!(
            doc.lookup(&["kapitan", "vars", "component"]).and_then(Value::as_str),
            Some("nfs")
        );
    }
}
