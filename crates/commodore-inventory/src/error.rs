use thiserror::Error;

/// Failure modes of hierarchy rendering.
///
/// All of these terminate the compile; the messages carry enough context
/// (class, key, reference path) to pinpoint the offending inventory file.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("class `{class}` not found (included from `{included_from}`)")]
    ClassNotFound {
        class: String,
        included_from: String,
    },

    #[error("class include cycle: {cycle}")]
    IncludeCycle { cycle: String },

    #[error("cannot override constant parameter `{key}`")]
    ConstantViolation { key: String },

    #[error("undefined reference `${{{path}}}`")]
    UndefinedReference { path: String },

    #[error("reference cycle while resolving `${{{path}}}`")]
    ReferenceCycle { path: String },

    #[error("cannot embed non-scalar reference `${{{path}}}` in a string")]
    NonScalarInterpolation { path: String },

    #[error("unterminated reference in `{value}`")]
    UnterminatedReference { value: String },

    #[error("class include name `{name}` did not resolve to a string")]
    UnresolvedClassName { name: String },

    #[error("malformed class `{class}`: {detail}")]
    MalformedClass { class: String, detail: String },

    #[error("failed to read class `{class}`")]
    Io {
        class: String,
        #[source]
        source: std::io::Error,
    },
}
