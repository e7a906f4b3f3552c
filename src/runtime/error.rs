//! Error types for the weft runtime
//!
//! One flat taxonomy for construction and execution errors, with
//! conversions from I/O and parser errors at the loader boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A type definition violates the type grammar
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// A runtime value does not conform to its declared type
    #[error("data mismatch: expected {expected}, got {got}")]
    DataMismatch {
        /// The declared type
        expected: String,
        /// A rendering of the offending value
        got: String,
    },

    /// A property referenced in an expression or schema is absent
    #[error("missing property \"{0}\"")]
    MissingProperty(String),

    /// No builtin or definition file found for an operator id
    #[error("unknown operator \"{0}\"")]
    UnknownOperator(String),

    /// Two child instances share a name within the same parent
    #[error("colliding instance names within same parent operator: \"{0}\"")]
    DuplicateInstanceName(String),

    /// A definition file transitively imports itself
    #[error("recursive import of {0}")]
    RecursiveImport(PathBuf),

    /// A port reference string failed to resolve
    #[error("bad reference \"{reference}\": {detail}")]
    BadReference {
        /// The reference string as written in the definition
        reference: String,
        /// What went wrong while resolving it
        detail: String,
    },

    /// Two ports cannot be wired together
    #[error("incompatible connection: {0}")]
    IncompatibleConnection(String),

    /// A leaf input port is missing its source after building
    #[error("unconnected input port: {0}")]
    UnconnectedInput(String),

    /// A generic identifier survived specialization
    #[error("generic not specified: {0}")]
    GenericUnresolved(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON definition could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML definition could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
