use std::path::{Path, PathBuf};

use crate::error::RenderError;
use crate::value::Value;

/// A parsed inventory class.
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    /// Ordered include list (`classes` key).
    pub includes: Vec<String>,
    /// Deep-mergeable parameter tree (`parameters` key).
    pub parameters: Value,
}

/// Directory-backed class storage.
///
/// Class `a.b.c` lives at `<root>/a/b/c.yml`; directories may be symlinks
/// into dependency worktrees (components, packages, the global and tenant
/// repositories), which is how the resolver wires fetched repositories
/// into the hierarchy.
#[derive(Debug, Clone)]
pub struct ClassStore {
    root: PathBuf,
}

impl ClassStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path backing a class name.
    pub fn class_file(&self, name: &str) -> PathBuf {
        let mut path = self.root.clone();
        for seg in name.split('.') {
            path.push(seg);
        }
        path.set_extension("yml");
        path
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.class_file(name).is_file()
    }

    /// Read and parse one class. An empty file is an empty class.
    pub fn read_class(&self, name: &str) -> Result<Class, RenderError> {
        let path = self.class_file(name);
        let raw = std::fs::read_to_string(&path).map_err(|source| RenderError::Io {
            class: name.to_string(),
            source,
        })?;

        if raw.trim().is_empty() {
            return Ok(Class {
                name: name.to_string(),
                includes: Vec::new(),
                parameters: Value::empty_map(),
            });
        }

        let doc: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|e| RenderError::MalformedClass {
                class: name.to_string(),
                detail: e.to_string(),
            })?;

        let includes = match doc.get("classes") {
            None | Some(serde_yaml::Value::Null) => Vec::new(),
            Some(serde_yaml::Value::Sequence(seq)) => {
                let mut out = Vec::with_capacity(seq.len());
                for item in seq {
                    match item.as_str() {
                        Some(s) => out.push(s.to_string()),
                        None => {
                            return Err(RenderError::MalformedClass {
                                class: name.to_string(),
                                detail: "`classes` entries must be strings".to_string(),
                            });
                        }
                    }
                }
                out
            }
            Some(_) => {
                return Err(RenderError::MalformedClass {
                    class: name.to_string(),
                    detail: "`classes` must be a list".to_string(),
                });
            }
        };

        let parameters = match doc.get("parameters") {
            None | Some(serde_yaml::Value::Null) => Value::empty_map(),
            Some(params @ serde_yaml::Value::Mapping(_)) => Value::from_yaml(params),
            Some(_) => {
                return Err(RenderError::MalformedClass {
                    class: name.to_string(),
                    detail: "`parameters` must be a map".to_string(),
                });
            }
        };

        Ok(Class {
            name: name.to_string(),
            includes,
            parameters,
        })
    }

    /// Write a class document, creating parent directories as needed.
    pub fn write_class(
        &self,
        name: &str,
        includes: &[String],
        parameters: &Value,
    ) -> Result<(), RenderError> {
        let path = self.class_file(name);
        let io_err = |source| RenderError::Io {
            class: name.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut doc = serde_yaml::Mapping::new();
        if !includes.is_empty() {
            doc.insert(
                serde_yaml::Value::String("classes".to_string()),
                serde_yaml::Value::Sequence(
                    includes
                        .iter()
                        .map(|c| serde_yaml::Value::String(c.clone()))
                        .collect(),
                ),
            );
        }
        doc.insert(
            serde_yaml::Value::String("parameters".to_string()),
            parameters.to_yaml(),
        );

        let rendered = serde_yaml::to_string(&serde_yaml::Value::Mapping(doc)).map_err(|e| {
            RenderError::MalformedClass {
                class: name.to_string(),
                detail: e.to_string(),
            }
        })?;
        std::fs::write(&path, rendered).map_err(io_err)
    }
}
