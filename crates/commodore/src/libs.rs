use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::error::Error;
use crate::model::Component;
use crate::workdir::force_symlink;

/// Aggregate every component's `lib/` into the shared search directory,
/// enforcing the library namespacing rules.
///
/// A component owns filenames starting with `<name>-` or equal to
/// `<name>.libsonnet`. It may additionally advertise aliases through
/// `_metadata.library_aliases`, each pointing at one of its own files and
/// itself subject to the ownership rules. A predecessor's prefix is only
/// usable under the declared replacement handshake; any other collision is
/// fatal.
pub fn deploy_libraries(
    components: &BTreeMap<String, Component>,
    lib_dir: &Path,
) -> Result<()> {
    check_replacement_handshake(components)?;

    std::fs::create_dir_all(lib_dir)
        .with_context(|| format!("failed to create {}", lib_dir.display()))?;

    // Tracks which component claimed each deployed filename.
    let mut claimed: BTreeMap<String, String> = BTreeMap::new();

    for (name, component) in components {
        let component_lib = component.content_dir().join("lib");
        if !component_lib.is_dir() {
            continue;
        }

        let mut entries: Vec<_> = std::fs::read_dir(&component_lib)
            .with_context(|| format!("failed to read {}", component_lib.display()))?
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("failed to read {}", component_lib.display()))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            check_ownership(component, &file_name, components)?;
            claim(&mut claimed, &file_name, name)?;
            force_symlink(&entry.path(), &lib_dir.join(&file_name))?;
        }

        for (alias, target) in &component.metadata.library_aliases {
            let target_path = component_lib.join(target);
            if target.contains('/') || !target_path.is_file() {
                bail!(Error::Config(format!(
                    "component `{name}` aliases `{alias}` to `{target}`, \
                     which is not a library of the component"
                )));
            }
            check_ownership(component, alias, components)?;
            claim(&mut claimed, alias, name)?;
            force_symlink(&target_path, &lib_dir.join(alias))?;
        }
    }

    Ok(())
}

/// `_metadata.replaced_by` requires the deployed successor to declare
/// `replaces` back, otherwise the predecessor's library prefix would leak
/// without a handshake.
fn check_replacement_handshake(components: &BTreeMap<String, Component>) -> Result<()> {
    for (name, component) in components {
        if let Some(successor) = &component.metadata.replaced_by {
            if let Some(successor_component) = components.get(successor) {
                if successor_component.metadata.replaces.as_deref() != Some(name) {
                    bail!(Error::LibraryPrefixConflict(format!(
                        "component `{name}` is replaced by `{successor}`, but `{successor}` \
                         does not declare `replaces: {name}`"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_ownership(
    component: &Component,
    file_name: &str,
    components: &BTreeMap<String, Component>,
) -> Result<()> {
    let name = &component.common.name;
    if owns(name, file_name) {
        return Ok(());
    }

    if let Some(predecessor) = &component.metadata.replaces {
        if owns(predecessor, file_name) {
            match components.get(predecessor) {
                // Predecessor not deployed on this cluster: prefix is free.
                None => return Ok(()),
                Some(pred) => {
                    if pred.metadata.deprecated
                        && pred.metadata.replaced_by.as_deref() == Some(name.as_str())
                    {
                        return Ok(());
                    }
                    bail!(Error::LibraryPrefixConflict(format!(
                        "component `{name}` uses the library prefix of `{predecessor}`, \
                         which is still deployed and not deprecated in its favor"
                    )));
                }
            }
        }
    }

    bail!(Error::LibraryPrefixConflict(format!(
        "component `{name}` ships library `{file_name}`, which is outside its \
         `{name}-` prefix and not covered by a declared replacement"
    )))
}

fn owns(component: &str, file_name: &str) -> bool {
    file_name == format!("{component}.libsonnet")
        || file_name.starts_with(&format!("{component}-"))
}

fn claim(claimed: &mut BTreeMap<String, String>, file_name: &str, owner: &str) -> Result<()> {
    if let Some(previous) = claimed.get(file_name) {
        bail!(Error::LibraryPrefixConflict(format!(
            "components `{previous}` and `{owner}` both provide library `{file_name}`"
        )));
    }
    claimed.insert(file_name.to_string(), owner.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use tempfile::{TempDir, tempdir};

    use crate::model::{ComponentMetadata, DependencyCommon, RepoHandle};

    struct Fixture {
        _td: TempDir,
        root: PathBuf,
        lib_dir: PathBuf,
        components: BTreeMap<String, Component>,
    }

    impl Fixture {
        fn new() -> Self {
            let td = tempdir().expect("tempdir");
            let root = td.path().to_path_buf();
            let lib_dir = root.join("lib");
            Self {
                _td: td,
                root,
                lib_dir,
                components: BTreeMap::new(),
            }
        }

        fn component(&mut self, name: &str, libs: &[&str], metadata: ComponentMetadata) {
            let checkout = self.root.join(name);
            let lib = checkout.join("lib");
            std::fs::create_dir_all(&lib).expect("mkdir");
            for file in libs {
                std::fs::write(lib.join(file), format!("// {file}")).expect("write");
            }
            self.components.insert(
                name.to_string(),
                Component {
                    common: DependencyCommon {
                        name: name.to_string(),
                        repo: RepoHandle::new("https://git.example.com/x.git", None),
                        checkout,
                    },
                    metadata,
                },
            );
        }

        fn deploy(&self) -> Result<()> {
            deploy_libraries(&self.components, &self.lib_dir)
        }
    }

    #[test]
    fn prefixed_libraries_deploy() {
        let mut fx = Fixture::new();
        fx.component(
            "nfs",
            &["nfs.libsonnet", "nfs-storage.libsonnet"],
            ComponentMetadata::default(),
        );
        fx.deploy().expect("deploy");
        assert!(fx.lib_dir.join("nfs.libsonnet").exists());
        assert!(fx.lib_dir.join("nfs-storage.libsonnet").exists());
    }

    #[test]
    fn unprefixed_library_is_rejected() {
        let mut fx = Fixture::new();
        fx.component("nfs", &["storage.libsonnet"], ComponentMetadata::default());
        let err = fx.deploy().expect_err("must fail");
        assert!(format!("{err:#}").contains("storage.libsonnet"));
    }

    #[test]
    fn prefix_of_unrelated_component_is_rejected() {
        let mut fx = Fixture::new();
        fx.component("nfs", &["nfs.libsonnet"], ComponentMetadata::default());
        fx.component(
            "backup",
            &["nfs-helpers.libsonnet"],
            ComponentMetadata::default(),
        );
        let err = fx.deploy().expect_err("must fail");
        assert!(format!("{err:#}").contains("backup"));
    }

    #[test]
    fn alias_to_own_library_deploys() {
        let mut fx = Fixture::new();
        fx.component(
            "nfs",
            &["nfs-shared.libsonnet"],
            ComponentMetadata {
                library_aliases: BTreeMap::from([(
                    "nfs-interface.libsonnet".to_string(),
                    "nfs-shared.libsonnet".to_string(),
                )]),
                ..Default::default()
            },
        );
        fx.deploy().expect("deploy");
        assert!(fx.lib_dir.join("nfs-interface.libsonnet").exists());
    }

    #[test]
    fn alias_to_foreign_file_is_rejected() {
        let mut fx = Fixture::new();
        fx.component(
            "nfs",
            &["nfs.libsonnet"],
            ComponentMetadata {
                library_aliases: BTreeMap::from([(
                    "nfs-extra.libsonnet".to_string(),
                    "ghost.libsonnet".to_string(),
                )]),
                ..Default::default()
            },
        );
        let err = fx.deploy().expect_err("must fail");
        assert!(format!("{err:#}").contains("not a library of the component"));
    }

    #[test]
    fn successor_may_use_prefix_of_undeployed_predecessor() {
        let mut fx = Fixture::new();
        fx.component(
            "nfs-ng",
            &["nfs.libsonnet"],
            ComponentMetadata {
                replaces: Some("nfs".to_string()),
                ..Default::default()
            },
        );
        fx.deploy().expect("deploy");
        assert!(fx.lib_dir.join("nfs.libsonnet").exists());
    }

    #[test]
    fn successor_needs_deprecated_predecessor_when_both_deployed() {
        let mut fx = Fixture::new();
        fx.component("nfs", &[], ComponentMetadata::default());
        fx.component(
            "nfs-ng",
            &["nfs.libsonnet"],
            ComponentMetadata {
                replaces: Some("nfs".to_string()),
                ..Default::default()
            },
        );
        let err = fx.deploy().expect_err("must fail");
        assert!(format!("{err:#}").contains("still deployed"));
    }

    #[test]
    fn deprecation_handshake_allows_prefix_reuse() {
        let mut fx = Fixture::new();
        fx.component(
            "nfs",
            &[],
            ComponentMetadata {
                deprecated: true,
                replaced_by: Some("nfs-ng".to_string()),
                ..Default::default()
            },
        );
        fx.component(
            "nfs-ng",
            &["nfs.libsonnet"],
            ComponentMetadata {
                replaces: Some("nfs".to_string()),
                ..Default::default()
            },
        );
        fx.deploy().expect("deploy");
        assert!(fx.lib_dir.join("nfs.libsonnet").exists());
    }

    #[test]
    fn replaced_by_without_replaces_on_successor_is_rejected() {
        let mut fx = Fixture::new();
        fx.component(
            "nfs",
            &[],
            ComponentMetadata {
                deprecated: true,
                replaced_by: Some("nfs-ng".to_string()),
                ..Default::default()
            },
        );
        fx.component("nfs-ng", &[], ComponentMetadata::default());
        let err = fx.deploy().expect_err("must fail");
        assert!(format!("{err:#}").contains("does not declare `replaces: nfs`"));
    }

    #[test]
    fn duplicate_claims_across_components_are_rejected() {
        let mut fx = Fixture::new();
        fx.component("nfs", &["nfs.libsonnet"], ComponentMetadata::default());
        fx.component(
            "nfs-ng",
            &["nfs.libsonnet"],
            ComponentMetadata {
                replaces: Some("nfs".to_string()),
                ..Default::default()
            },
        );
        // Ownership would pass for nfs-ng only with the deprecation
        // handshake; without it the collision is already fatal.
        let err = fx.deploy().expect_err("must fail");
        assert!(format!("{err:#}").contains("nfs"));
    }
}
