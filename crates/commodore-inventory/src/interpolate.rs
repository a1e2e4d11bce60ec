use crate::error::RenderError;
use crate::value::Value;

/// Resolve all `${a:b:c}` references in a parameter tree.
///
/// References resolve against the final merged tree. A string consisting
/// of exactly one reference is replaced by the referenced value (which may
/// be a map or list); a reference embedded in a longer string must resolve
/// to a scalar. References nest (`${a:${which}}` resolves the inner
/// reference first) and cycles are errors. `\${...}` escapes to a literal
/// `${...}`, and `?{...}` secret tokens pass through untouched.
pub fn interpolate(root: &Value) -> Result<Value, RenderError> {
    let resolver = Resolver { root };
    let mut stack = Vec::new();
    resolver.resolve_value(root, &mut stack)
}

/// Resolve references inside a single string against `root`.
///
/// Used for class include names, which may depend on parameters merged so
/// far (e.g. `global.distribution.${facts:distribution}`).
pub fn interpolate_str(root: &Value, s: &str) -> Result<String, RenderError> {
    let resolver = Resolver { root };
    let mut stack = Vec::new();
    match resolver.resolve_string(s, &mut stack)? {
        Value::String(out) => Ok(out),
        other => other
            .scalar_to_string()
            .ok_or_else(|| RenderError::UnresolvedClassName {
                name: s.to_string(),
            }),
    }
}

struct Resolver<'a> {
    root: &'a Value,
}

impl Resolver<'_> {
    fn resolve_value(&self, value: &Value, stack: &mut Vec<String>) -> Result<Value, RenderError> {
        match value {
            Value::String(s) => self.resolve_string(s, stack),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_value(item, stack)?);
                }
                Ok(Value::List(out))
            }
            Value::Map(map) => {
                let mut out = std::collections::BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, stack)?);
                }
                Ok(Value::Map(out))
            }
            Value::Constant(inner) => Ok(Value::Constant(Box::new(
                self.resolve_value(inner, stack)?,
            ))),
            scalar => Ok(scalar.clone()),
        }
    }

    fn resolve_string(&self, s: &str, stack: &mut Vec<String>) -> Result<Value, RenderError> {
        let bytes = s.as_bytes();
        let mut out = String::new();
        let mut i = 0;
        let mut lone_ref: Option<Value> = None;
        let mut pieces = 0;

        while i < bytes.len() {
            // Escaped reference: `\${` emits a literal `${`.
            if bytes[i] == b'\\' && i + 2 < bytes.len() && &bytes[i + 1..i + 3] == b"${" {
                out.push_str("${");
                i += 3;
                pieces += 1;
                lone_ref = None;
                continue;
            }
            if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                let end = find_closing(s, i + 2).ok_or_else(|| {
                    RenderError::UnterminatedReference {
                        value: s.to_string(),
                    }
                })?;
                let inner_raw = &s[i + 2..end];
                let inner = if inner_raw.contains("${") {
                    match self.resolve_string(inner_raw, stack)? {
                        Value::String(resolved) => resolved,
                        other => other.scalar_to_string().ok_or_else(|| {
                            RenderError::NonScalarInterpolation {
                                path: inner_raw.to_string(),
                            }
                        })?,
                    }
                } else {
                    inner_raw.to_string()
                };

                let resolved = self.resolve_path(&inner, stack)?;
                if i == 0 && end + 1 == bytes.len() && pieces == 0 {
                    lone_ref = Some(resolved);
                } else {
                    let scalar = resolved.scalar_to_string().ok_or_else(|| {
                        RenderError::NonScalarInterpolation {
                            path: inner.clone(),
                        }
                    })?;
                    out.push_str(&scalar);
                    lone_ref = None;
                }
                pieces += 1;
                i = end + 1;
                continue;
            }
            let ch = s[i..].chars().next().unwrap_or('\u{fffd}');
            out.push(ch);
            i += ch.len_utf8();
            pieces += 1;
            lone_ref = None;
        }

        // A string that was exactly one reference takes the referenced
        // value wholesale, preserving its type.
        if let Some(value) = lone_ref {
            return Ok(value);
        }
        Ok(Value::String(out))
    }

    fn resolve_path(&self, path: &str, stack: &mut Vec<String>) -> Result<Value, RenderError> {
        if stack.iter().any(|p| p == path) {
            return Err(RenderError::ReferenceCycle {
                path: path.to_string(),
            });
        }

        let segments: Vec<&str> = path.split(':').collect();
        let target = self
            .root
            .lookup(&segments)
            .ok_or_else(|| RenderError::UndefinedReference {
                path: path.to_string(),
            })?;

        stack.push(path.to_string());
        let resolved = self.resolve_value(target, stack);
        stack.pop();
        resolved
    }
}

/// Find the `}` closing a reference opened at `start` (the byte after
/// `${`), accounting for nested `${`.
fn find_closing(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 1;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            depth += 1;
            i += 2;
            continue;
        }
        if bytes[i] == b'}' {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}
