//! CLI error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Engine(#[from] veil_core::Error),

    /// A policy body failed to parse; the message is already rendered with
    /// source context.
    #[error("policy '{policy}':\n{rendered}")]
    Body { policy: String, rendered: String },

    #[error("{0}")]
    Invalid(String),

    #[error("{0} problem(s) found")]
    CheckFailed(usize),
}

pub type Result<T> = std::result::Result<T, CliError>;
