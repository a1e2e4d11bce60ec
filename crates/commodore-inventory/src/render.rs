use std::collections::BTreeSet;

use crate::error::RenderError;
use crate::interpolate::{interpolate, interpolate_str};
use crate::store::ClassStore;
use crate::value::{Value, merge};

/// Result of rendering a hierarchy.
#[derive(Debug, Clone)]
pub struct Rendered {
    /// All included classes in merge order, deduplicated to the first
    /// occurrence.
    pub classes: Vec<String>,
    /// Fully merged and reference-resolved parameter tree.
    pub parameters: Value,
    /// The `applications` parameter after `~`-operator resolution.
    pub applications: Vec<String>,
}

/// Render a hierarchy from an ordered seed list.
pub fn render_classes(store: &ClassStore, seeds: &[String]) -> Result<Rendered, RenderError> {
    render_classes_with(store, seeds, None)
}

/// Render a hierarchy, deep-merging `overlay` on top of the class
/// parameters before reference resolution.
///
/// The overlay is how per-target values (`_instance`, `_base_directory`)
/// become visible to `${...}` references in component parameters.
pub fn render_classes_with(
    store: &ClassStore,
    seeds: &[String],
    overlay: Option<&Value>,
) -> Result<Rendered, RenderError> {
    let mut expansion = Expansion {
        store,
        order: Vec::new(),
        seen: BTreeSet::new(),
        ancestry: Vec::new(),
        parameters: Value::empty_map(),
    };

    for seed in seeds {
        expansion.expand(seed, "<seeds>")?;
    }

    let mut parameters = expansion.parameters;
    if let Some(overlay) = overlay {
        parameters = merge(parameters, overlay.clone())?;
    }
    let parameters = interpolate(&parameters)?;

    let applications = match parameters.get("applications") {
        None => Vec::new(),
        Some(value) => {
            let entries =
                value
                    .as_string_list()
                    .ok_or_else(|| RenderError::MalformedClass {
                        class: "applications".to_string(),
                        detail: "`applications` must be a list of strings".to_string(),
                    })?;
            render_array(&entries)
        }
    };

    Ok(Rendered {
        classes: expansion.order,
        parameters,
        applications,
    })
}

struct Expansion<'a> {
    store: &'a ClassStore,
    order: Vec<String>,
    seen: BTreeSet<String>,
    ancestry: Vec<String>,
    parameters: Value,
}

impl Expansion<'_> {
    /// Depth-first, left-to-right include expansion. A class's own
    /// parameters merge after everything it includes, repeated includes
    /// collapse to the first occurrence, and include names may carry
    /// references resolved against the parameters merged so far.
    fn expand(&mut self, raw_name: &str, included_from: &str) -> Result<(), RenderError> {
        let name = if raw_name.contains("${") {
            interpolate_str(&self.parameters, raw_name)?
        } else {
            raw_name.to_string()
        };

        if self.seen.contains(&name) {
            return Ok(());
        }
        if self.ancestry.iter().any(|c| c == &name) {
            let mut cycle = self.ancestry.join(" -> ");
            cycle.push_str(" -> ");
            cycle.push_str(&name);
            return Err(RenderError::IncludeCycle { cycle });
        }

        let class = match self.store.read_class(&name) {
            Ok(class) => class,
            Err(RenderError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return Err(RenderError::ClassNotFound {
                    class: name,
                    included_from: included_from.to_string(),
                });
            }
            Err(other) => return Err(other),
        };

        self.ancestry.push(name.clone());
        for include in &class.includes {
            self.expand(include, &name)?;
        }
        self.ancestry.pop();

        self.seen.insert(name.clone());
        self.order.push(name);
        self.parameters = merge(std::mem::replace(&mut self.parameters, Value::Null), class.parameters)?;
        Ok(())
    }
}

/// Resolve an `applications`-style list.
///
/// Entries accumulate in order; an entry `~x` removes the last previously
/// accumulated occurrence of `x`; plain re-listing of an already present
/// entry is a no-op. The result therefore contains exactly the strings
/// whose last occurrence in the input is not `~`-prefixed.
pub fn render_array(entries: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in entries {
        if let Some(stripped) = entry.strip_prefix('~') {
            if let Some(pos) = out.iter().rposition(|x| x == stripped) {
                out.remove(pos);
            }
        } else if !out.iter().any(|x| x == entry) {
            out.push(entry.clone());
        }
    }
    out
}
