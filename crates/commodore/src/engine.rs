use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use commodore_inventory::ClassStore;
use commodore_process::{Invocation, engine_program};

use crate::Reporter;
use crate::error::Error;
use crate::target::Target;
use crate::workdir::Workdir;

/// Write one target document per instance into `inventory/targets/`.
///
/// The engine reads these alongside `inventory/classes/`; the documents
/// carry the instance's class list, the injected `_instance` family, the
/// merged instance parameters and the per-target `kapitan.vars`.
pub fn write_targets(workdir: &Workdir, targets: &[Target]) -> Result<()> {
    let store = ClassStore::new(workdir.targets());
    for target in targets {
        store
            .write_class(&target.name, &target.classes, &target.parameters)
            .map_err(Error::Render)
            .with_context(|| format!("failed to write target `{}`", target.name))?;
    }
    Ok(())
}

/// Driver for the external Kapitan-compatible templating engine.
///
/// The engine is a black box: it reads the targets directory and the
/// inventory, resolves imports through the aggregated library directory
/// and the package class dirs, and writes `compiled/<instance>/...`.
/// Output files are read from disk afterwards; engine stdout is never
/// parsed.
#[derive(Debug)]
pub struct EngineDriver {
    bin: String,
}

impl EngineDriver {
    /// Driver for the configured engine binary
    /// (`COMMODORE_ENGINE_BIN`, default `kapitan`).
    pub fn new() -> Self {
        Self {
            bin: engine_program(),
        }
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Invoke the engine once over all targets.
    pub fn run(
        &self,
        workdir: &Workdir,
        targets: &[Target],
        package_class_dirs: &[PathBuf],
        parallelism: usize,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        if targets.is_empty() {
            reporter.info("no targets to render");
            return Ok(());
        }
        reporter.info(&format!("rendering {} target(s)...", targets.len()));

        let mut invocation = Invocation::new(self.bin.as_str())
            .current_dir(workdir.root())
            .passthrough("SSH_AUTH_SOCK")
            .args(["compile"])
            .args([
                "--output-path".to_string(),
                workdir.root().display().to_string(),
            ])
            .args([
                "--inventory-path".to_string(),
                workdir.inventory().display().to_string(),
            ])
            .args(["--parallelism".to_string(), parallelism.to_string()])
            .args([
                "--search-paths".to_string(),
                workdir.root().display().to_string(),
                workdir.lib_dir().display().to_string(),
            ]);
        for dir in package_class_dirs {
            invocation = invocation.arg(dir.display().to_string());
        }

        let out = invocation.run()?;
        if !out.success() {
            let context = targets
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            bail!(Error::Engine {
                context: format!("targets {context}"),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Default for EngineDriver {
    fn default() -> Self {
        Self::new()
    }
}
