//! Error types for the tally agent.

use thiserror::Error;

/// Errors that can occur in agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A metric source could not be sampled.
    #[error("sampling {source_name} failed: {reason}")]
    Sampling {
        /// Name of the failing source.
        source_name: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// Encoding or store error from the core crate.
    #[error(transparent)]
    Core(#[from] tally_core::CoreError),

    /// The request could not be sent.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("server rejected batch with status {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// The RPC call returned an error frame.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// RPC status code.
        code: i32,
        /// Server message.
        message: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
