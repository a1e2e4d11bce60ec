use std::collections::BTreeMap;

use crate::error::RenderError;

/// A node in the parameter tree.
///
/// The tree is heterogeneous: scalars, lists, maps, and a `Constant`
/// wrapper recording that a key was declared with the `=` prefix and may
/// not be reassigned by later classes. Maps are `BTreeMap` so iteration
/// order (and therefore every rendered artifact) is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Constant(Box<Value>),
}

impl Value {
    /// Empty map, the identity element for merging.
    pub fn empty_map() -> Value {
        Value::Map(BTreeMap::new())
    }

    /// Build a tree from a parsed YAML document.
    ///
    /// Map keys prefixed with `=` become [`Value::Constant`] entries under
    /// the unprefixed key. Keys suffixed with `+` are kept verbatim; the
    /// suffix is interpreted (and stripped) at merge time.
    pub fn from_yaml(yaml: &serde_yaml::Value) -> Value {
        match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_yaml::Value::String(s) => Value::String(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                Value::List(seq.iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    let key = yaml_key_to_string(k);
                    let value = Value::from_yaml(v);
                    if let Some(stripped) = key.strip_prefix('=') {
                        out.insert(stripped.to_string(), Value::Constant(Box::new(value)));
                    } else {
                        out.insert(key, value);
                    }
                }
                Value::Map(out)
            }
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }

    /// Convert back to YAML. Constant wrappers are transparent.
    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Value::Null => serde_yaml::Value::Null,
            Value::Bool(b) => serde_yaml::Value::Bool(*b),
            Value::Int(i) => serde_yaml::Value::Number((*i).into()),
            Value::Float(f) => serde_yaml::Value::Number(serde_yaml::Number::from(*f)),
            Value::String(s) => serde_yaml::Value::String(s.clone()),
            Value::List(items) => {
                serde_yaml::Value::Sequence(items.iter().map(Value::to_yaml).collect())
            }
            Value::Map(map) => {
                let mut out = serde_yaml::Mapping::new();
                for (k, v) in map {
                    out.insert(serde_yaml::Value::String(k.clone()), v.to_yaml());
                }
                serde_yaml::Value::Mapping(out)
            }
            Value::Constant(inner) => inner.to_yaml(),
        }
    }

    /// Convert to JSON. Constant wrappers are transparent.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(out)
            }
            Value::Constant(inner) => inner.to_json(),
        }
    }

    /// Strip Constant wrappers (one level).
    pub fn unwrap_const(&self) -> &Value {
        match self {
            Value::Constant(inner) => inner.unwrap_const(),
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unwrap_const() {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self.unwrap_const() {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self.unwrap_const() {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unwrap_const() {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Child lookup on maps, transparent over Constant.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Walk a `a:b:c`-style path.
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut cur = self;
        for seg in path {
            cur = cur.get(seg)?;
        }
        Some(cur)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self.unwrap_const(),
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_)
        )
    }

    /// Render a scalar for embedding into an interpolated string.
    pub fn scalar_to_string(&self) -> Option<String> {
        match self.unwrap_const() {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// List of strings, or None when the value is not a list of strings.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        self.as_list()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

fn yaml_key_to_string(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Deep-merge `overlay` into `base`, reclass style.
///
/// Maps deep-merge; everything else replaces. A `key+` entry appends to a
/// base list (maps already deep-merge, so the suffix is a no-op there).
/// Assigning over a `Constant` base is an error.
pub fn merge(base: Value, overlay: Value) -> Result<Value, RenderError> {
    merge_entry("", base, overlay, false)
}

fn merge_entry(key: &str, base: Value, overlay: Value, append: bool) -> Result<Value, RenderError> {
    if let Value::Constant(_) = base {
        return Err(RenderError::ConstantViolation {
            key: key.to_string(),
        });
    }

    match (base, overlay) {
        (Value::Map(mut base_map), Value::Map(overlay_map)) => {
            for (raw_key, overlay_value) in overlay_map {
                let (child_key, child_append) = match raw_key.strip_suffix('+') {
                    Some(stripped) if !stripped.is_empty() => (stripped.to_string(), true),
                    _ => (raw_key, false),
                };
                let merged = match base_map.remove(&child_key) {
                    Some(base_value) => {
                        merge_entry(&child_key, base_value, overlay_value, child_append)?
                    }
                    None => overlay_value,
                };
                base_map.insert(child_key, merged);
            }
            Ok(Value::Map(base_map))
        }
        (Value::List(mut base_list), Value::List(overlay_list)) if append => {
            base_list.extend(overlay_list);
            Ok(Value::List(base_list))
        }
        (_, overlay) => Ok(overlay),
    }
}
