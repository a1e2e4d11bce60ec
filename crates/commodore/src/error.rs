use thiserror::Error;

/// Typed failure kinds of a catalog compile.
///
/// Everything here terminates the compile. Errors are constructed at the
/// failure site and carried through `anyhow`, so callers can downcast to
/// report the kind while keeping the surrounding context chain.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown dependency `{0}`: listed in `applications` but missing from the inventory")]
    UnknownDependency(String),

    #[error(
        "`{0}` declares a version but no url at its first declaration; \
         add `url` or fix the dependency name"
    )]
    AmbiguousVersionOverride(String),

    #[error("duplicate component instance `{0}`")]
    DuplicateInstance(String),

    #[error("component `{component}` does not support instantiation (requested alias `{alias}`)")]
    InstancingNotSupported { component: String, alias: String },

    #[error("component library conflict: {0}")]
    LibraryPrefixConflict(String),

    #[error("cannot reach remote `{url}`: {detail}")]
    UnreachableRemote { url: String, detail: String },

    #[error("cannot resolve revision `{revision}` in `{url}`")]
    UnresolvedRevision { revision: String, url: String },

    #[error("worktree `{0}` has local modifications; commit or discard them, or rerun with --force")]
    DirtyWorktree(String),

    #[error("permission denied for `{url}`: {detail}")]
    PermissionDenied { url: String, detail: String },

    #[error("hierarchy rendering failed: {0}")]
    Render(#[from] commodore_inventory::RenderError),

    #[error("templating engine failed ({context}):\n{stderr}")]
    Engine { context: String, stderr: String },

    #[error("postprocessing filter `{filter}` failed for instance `{instance}`: {detail}")]
    Filter {
        instance: String,
        filter: String,
        detail: String,
    },

    #[error("catalog push failed: {0}")]
    CatalogPush(String),
}
