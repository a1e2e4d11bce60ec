use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use commodore_inventory::Value;
use walkdir::WalkDir;

use crate::error::Error;

/// A parsed `?{<backend>:<keypath>[:<field>]}` token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SecretRef {
    pub backend: String,
    pub keypath: String,
    /// Explicit field; when absent the last `/` segment of the keypath
    /// doubles as the field.
    pub field: Option<String>,
}

impl SecretRef {
    /// Parse the inside of a `?{...}` token.
    fn parse(token: &str) -> Option<SecretRef> {
        let (backend, rest) = token.split_once(':')?;
        if backend.is_empty() || rest.is_empty() {
            return None;
        }
        let (keypath, field) = match rest.split_once(':') {
            Some((keypath, field)) if !field.is_empty() => {
                (keypath.to_string(), Some(field.to_string()))
            }
            _ => (rest.to_string(), None),
        };
        Some(SecretRef {
            backend: backend.to_string(),
            keypath,
            field,
        })
    }

    /// Vault path and field recorded in the reference file. Without an
    /// explicit field, the keypath's last segment is the field and the
    /// rest is the path.
    fn path_and_field(&self) -> (String, String) {
        match &self.field {
            Some(field) => (self.keypath.clone(), field.clone()),
            None => match self.keypath.rsplit_once('/') {
                Some((path, field)) => (path.to_string(), field.to_string()),
                None => (self.keypath.clone(), self.keypath.clone()),
            },
        }
    }

    /// Deterministic reference file body: sorted keys, trailing newline.
    fn file_body(&self) -> String {
        let (path, field) = self.path_and_field();
        let mut doc = BTreeMap::new();
        doc.insert("field", field);
        doc.insert("path", path);
        doc.insert("type", self.backend.clone());
        serde_yaml::to_string(&doc).expect("static reference document")
    }
}

/// Collect every secret reference token appearing in string values of the
/// parameter tree. The scan runs over parameters, not rendered YAML.
pub fn scan_parameters(parameters: &Value) -> BTreeSet<SecretRef> {
    let mut refs = BTreeSet::new();
    scan_value(parameters, &mut refs);
    refs
}

fn scan_value(value: &Value, refs: &mut BTreeSet<SecretRef>) {
    match value {
        Value::String(s) => scan_string(s, refs),
        Value::List(items) => {
            for item in items {
                scan_value(item, refs);
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                scan_value(item, refs);
            }
        }
        Value::Constant(inner) => scan_value(inner, refs),
        _ => {}
    }
}

fn scan_string(s: &str, refs: &mut BTreeSet<SecretRef>) {
    let mut rest = s;
    while let Some(start) = rest.find("?{") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        let token = &rest[start + 2..start + end];
        if let Some(secret_ref) = SecretRef::parse(token) {
            refs.insert(secret_ref);
        }
        rest = &rest[start + end + 1..];
    }
}

/// Materialize reference files under `catalog/refs/`.
///
/// One file per unique reference; files whose content already matches are
/// left untouched, and files not backed by any reference are removed so
/// the catalog and the references stay consistent.
pub fn write_refs(
    refs_dir: &Path,
    parameters: &Value,
    refs: &BTreeSet<SecretRef>,
) -> Result<Vec<String>> {
    let backends = enabled_backends(parameters)?;
    std::fs::create_dir_all(refs_dir)
        .with_context(|| format!("failed to create {}", refs_dir.display()))?;

    let mut written = Vec::new();
    let mut expected: BTreeSet<std::path::PathBuf> = BTreeSet::new();
    for secret_ref in refs {
        if !backends.contains(&secret_ref.backend) {
            bail!(Error::Config(format!(
                "secret reference `?{{{}:{}}}` uses backend `{}`, which is not \
                 configured under `secret_management`",
                secret_ref.backend, secret_ref.keypath, secret_ref.backend
            )));
        }
        if secret_ref.keypath.starts_with('/')
            || secret_ref.keypath.split('/').any(|seg| seg == ".." || seg.is_empty())
        {
            bail!(Error::Config(format!(
                "secret reference keypath `{}` is not a clean relative path",
                secret_ref.keypath
            )));
        }

        let path = refs_dir.join(&secret_ref.keypath);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = secret_ref.file_body();
        let unchanged = std::fs::read_to_string(&path)
            .map(|existing| existing == body)
            .unwrap_or(false);
        if !unchanged {
            std::fs::write(&path, &body)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        expected.insert(path);
        written.push(secret_ref.keypath.clone());
    }

    prune_orphans(refs_dir, &expected)?;
    Ok(written)
}

/// Backends enabled by `parameters.secret_management`. `vaultkv` is on by
/// default; the inventory may add others.
fn enabled_backends(parameters: &Value) -> Result<BTreeSet<String>> {
    let mut backends = BTreeSet::from(["vaultkv".to_string()]);
    if let Some(config) = parameters.get("secret_management") {
        if let Some(extra) = config.get("backends") {
            let list = extra.as_string_list().ok_or_else(|| {
                Error::Config("`secret_management.backends` must be a list of strings".to_string())
            })?;
            backends.extend(list);
        }
    }
    Ok(backends)
}

fn prune_orphans(refs_dir: &Path, expected: &BTreeSet<std::path::PathBuf>) -> Result<()> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(refs_dir).contents_first(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", refs_dir.display()))?;
        if entry.file_type().is_file() && !expected.contains(entry.path()) {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("failed to remove {}", entry.path().display()))?;
        } else if entry.file_type().is_dir() && entry.path() != refs_dir {
            dirs.push(entry.path().to_path_buf());
        }
    }
    // Deepest first, so emptied parents go too.
    dirs.sort();
    for dir in dirs.iter().rev() {
        let _ = std::fs::remove_dir(dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn v(yaml: &str) -> Value {
        Value::from_yaml(&serde_yaml::from_str(yaml).expect("yaml"))
    }

    #[test]
    fn scan_finds_refs_in_nested_values() {
        let params = v(
            "a:\n  pw: '?{vaultkv:cluster/db/password}'\nlist:\n  - '?{vaultkv:cluster/api/token}'\nplain: nothing\n",
        );
        let refs = scan_parameters(&params);
        let keypaths: Vec<&str> = refs.iter().map(|r| r.keypath.as_str()).collect();
        assert_eq!(keypaths, vec!["cluster/api/token", "cluster/db/password"]);
    }

    #[test]
    fn scan_dedups_repeated_references() {
        let params = v("a: '?{vaultkv:x/y}'\nb: 'prefix ?{vaultkv:x/y} suffix'\n");
        assert_eq!(scan_parameters(&params).len(), 1);
    }

    #[test]
    fn scan_ignores_interpolation_syntax() {
        let params = v("a: '${not:a:secret}'\nb: '?{}'\nc: '?{nokey}'\n");
        assert!(scan_parameters(&params).is_empty());
    }

    #[test]
    fn parse_splits_explicit_field() {
        let r = SecretRef::parse("vaultkv:cluster/db:password").expect("ref");
        assert_eq!(r.keypath, "cluster/db");
        assert_eq!(r.field.as_deref(), Some("password"));
        assert_eq!(
            r.path_and_field(),
            ("cluster/db".to_string(), "password".to_string())
        );
    }

    #[test]
    fn implicit_field_is_last_segment() {
        let r = SecretRef::parse("vaultkv:cluster/db/password").expect("ref");
        assert_eq!(
            r.path_and_field(),
            ("cluster/db".to_string(), "password".to_string())
        );
    }

    #[test]
    fn file_body_is_deterministic_with_trailing_newline() {
        let r = SecretRef::parse("vaultkv:cluster/db/password").expect("ref");
        let body = r.file_body();
        assert_eq!(body, "field: password\npath: cluster/db\ntype: vaultkv\n");
        assert_eq!(body, r.file_body());
    }

    #[test]
    fn write_refs_materializes_and_prunes() {
        let td = tempdir().expect("tempdir");
        let refs_dir = td.path().join("refs");
        let params = v("pw: '?{vaultkv:cluster/db/password}'");
        let refs = scan_parameters(&params);

        write_refs(&refs_dir, &params, &refs).expect("write");
        assert!(refs_dir.join("cluster/db/password").is_file());

        // A stale file from an earlier compile disappears.
        std::fs::write(refs_dir.join("cluster/db/old"), "stale").expect("write");
        write_refs(&refs_dir, &params, &refs).expect("write");
        assert!(!refs_dir.join("cluster/db/old").exists());
        assert!(refs_dir.join("cluster/db/password").is_file());
    }

    #[test]
    fn unchanged_files_are_not_rewritten() {
        let td = tempdir().expect("tempdir");
        let refs_dir = td.path().join("refs");
        let params = v("pw: '?{vaultkv:cluster/db/password}'");
        let refs = scan_parameters(&params);

        write_refs(&refs_dir, &params, &refs).expect("write");
        let file = refs_dir.join("cluster/db/password");
        let before = std::fs::metadata(&file).expect("meta").modified().expect("mtime");

        std::thread::sleep(std::time::Duration::from_millis(20));
        write_refs(&refs_dir, &params, &refs).expect("write");
        let after = std::fs::metadata(&file).expect("meta").modified().expect("mtime");
        assert_eq!(before, after);
    }

    #[test]
    fn unconfigured_backend_is_rejected() {
        let td = tempdir().expect("tempdir");
        let params = v("pw: '?{gkms:cluster/db/password}'");
        let refs = scan_parameters(&params);
        let err = write_refs(&td.path().join("refs"), &params, &refs).expect_err("must fail");
        assert!(format!("{err:#}").contains("gkms"));
    }

    #[test]
    fn extra_backends_can_be_enabled_by_the_inventory() {
        let td = tempdir().expect("tempdir");
        let params = v(
            "secret_management:\n  backends: [gkms]\npw: '?{gkms:cluster/db/password}'\n",
        );
        let refs = scan_parameters(&params);
        write_refs(&td.path().join("refs"), &params, &refs).expect("write");
        let body =
            std::fs::read_to_string(td.path().join("refs/cluster/db/password")).expect("read");
        assert!(body.contains("type: gkms"));
    }

    #[test]
    fn escaping_keypaths_are_rejected() {
        let td = tempdir().expect("tempdir");
        let params = v("pw: '?{vaultkv:../escape}'");
        let refs = scan_parameters(&params);
        let err = write_refs(&td.path().join("refs"), &params, &refs).expect_err("must fail");
        assert!(format!("{err:#}").contains("clean relative path"));
    }
}
