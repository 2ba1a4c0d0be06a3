//! Error types shared by the catalog and the template engine.

use thiserror::Error;

/// Errors from channel catalog construction and lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// No channel with the given name is known.
    #[error("Channel not found: {0}")]
    NotFound(String),

    /// Two channels share the same name.
    #[error("Duplicate channel name: {0}")]
    Duplicate(String),
}

/// Errors from rendering a command template.
///
/// These are configuration bugs and are meant to be caught when the
/// configuration is loaded, before any request is served.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The template uses a placeholder outside the recognized set.
    #[error("Unknown placeholder: {{{{{0}}}}}")]
    UnknownPlaceholder(String),

    /// A `{{` without a matching `}}`.
    #[error("Unterminated placeholder at offset {0}")]
    Unterminated(usize),

    /// The placeholder is recognized but the context has no value for it.
    #[error("Missing value for placeholder: {0}")]
    MissingField(&'static str),

    /// The template renders to nothing.
    #[error("Empty command template")]
    Empty,
}
