use std::str::FromStr;

/// Diff-noise suppression modes for catalog migrations.
///
/// Migrations only change what is *shown* and what counts as a material
/// change; the committed output is never mutated. The registry is an enum
/// so future migrations slot in next to their normalization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Hide object re-ordering, flow-style, indentation and quoting
    /// differences by comparing canonicalized YAML.
    IgnoreYamlFormatting,
    /// Everything `IgnoreYamlFormatting` hides, plus the
    /// `app.kubernetes.io/managed-by` label rename the Kapitan 0.29 to
    /// 0.30 upgrade causes.
    Kapitan029To030,
}

impl FromStr for Migration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore-yaml-formatting" => Ok(Migration::IgnoreYamlFormatting),
            "kapitan-0.29-to-0.30" => Ok(Migration::Kapitan029To030),
            other => Err(format!(
                "unknown migration `{other}` (expected `ignore-yaml-formatting` \
                 or `kapitan-0.29-to-0.30`)"
            )),
        }
    }
}

/// One file's portion of a unified diff.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub path: String,
    pub text: String,
}

/// Split `git diff` output into per-file chunks.
pub fn split_diff(diff: &str) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let mut current: Option<FileDiff> = None;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(file) = current.take() {
                files.push(file);
            }
            // `diff --git a/<path> b/<path>`; take the b-side.
            let path = rest
                .rsplit_once(" b/")
                .map(|(_, path)| path.to_string())
                .unwrap_or_else(|| rest.to_string());
            current = Some(FileDiff {
                path,
                text: String::new(),
            });
        }
        if let Some(file) = current.as_mut() {
            file.text.push_str(line);
            file.text.push('\n');
        }
    }
    if let Some(file) = current.take() {
        files.push(file);
    }
    files
}

/// Whether a change from `old` to `new` is pure noise under `migration`.
///
/// Both sides must parse as YAML; after canonicalization (and the
/// migration's label normalization) equal documents mean the change is
/// formatting only.
pub fn is_noise(migration: Migration, old: &str, new: &str) -> bool {
    let (Some(old_docs), Some(new_docs)) = (canonical_docs(migration, old), canonical_docs(migration, new))
    else {
        return false;
    };
    old_docs == new_docs
}

/// Parse a YAML stream into canonical (sorted-map) JSON documents.
fn canonical_docs(migration: Migration, raw: &str) -> Option<Vec<serde_json::Value>> {
    use serde::Deserialize;

    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(doc).ok()?;
        let mut json = serde_json::to_value(&value).ok()?;
        if migration == Migration::Kapitan029To030 {
            strip_managed_by(&mut json);
        }
        docs.push(json);
    }
    Some(docs)
}

/// Drop the `app.kubernetes.io/managed-by` label wherever it appears.
fn strip_managed_by(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.remove("app.kubernetes.io/managed-by");
            for child in map.values_mut() {
                strip_managed_by(child);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_managed_by(item);
            }
        }
        _ => {}
    }
}
