//! Typed error hierarchy for the chat chain engine.
//!
//! Two top-level enums cover the two layers:
//! - `ChainError` — pipeline loading, validation and phase execution failures
//! - `BackendError` — model backend selection, transport and response-shape failures
//!
//! A role-play session that runs out of turns is not an error; it ends with
//! `TerminationReason::TurnLimitReached` (see `session`).

use thiserror::Error;

/// Errors from loading, validating and executing a chain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Unresolvable backend/model mapping or malformed pipeline graph.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Phase '{phase}' is not implemented ({kind} phase)")]
    PhaseNotImplemented { phase: String, kind: &'static str },

    #[error("Phase type '{phase_type}' of phase '{phase}' is not implemented")]
    UnknownPhaseType { phase: String, phase_type: String },

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Backend call failed in phase '{phase}': {source}")]
    Backend {
        phase: String,
        #[source]
        source: BackendError,
    },

    #[error("Chain cancelled before phase '{phase}'")]
    Cancelled { phase: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChainError {
    /// Short stable name of the error kind, used in audit records and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::Configuration(_) => "configuration",
            ChainError::PhaseNotImplemented { .. } => "phase_not_implemented",
            ChainError::UnknownPhaseType { .. } => "unknown_phase_type",
            ChainError::UpstreamProtocol(_) => "upstream_protocol",
            ChainError::Backend { .. } => "backend",
            ChainError::Cancelled { .. } => "cancelled",
            ChainError::Io { .. } => "io",
            ChainError::Other(_) => "other",
        }
    }

    /// Wrap a backend failure raised while running `phase`.
    ///
    /// Shape violations keep their own kind so callers can tell a misbehaving
    /// vendor apart from a transport failure.
    pub fn from_backend(phase: &str, err: BackendError) -> Self {
        match err {
            BackendError::UpstreamProtocol(msg) => {
                ChainError::UpstreamProtocol(format!("{} (phase '{}')", msg, phase))
            }
            BackendError::Configuration(msg) => ChainError::Configuration(msg),
            other => ChainError::Backend {
                phase: phase.to_string(),
                source: other,
            },
        }
    }
}

/// Errors from a model backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("No backend registered for vendor '{vendor}' with api style '{api_style}'")]
    Unregistered { vendor: String, api_style: String },

    #[error("Backend configuration error: {0}")]
    Configuration(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Vendor returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The vendor answered, but not in the normalized completion shape.
    #[error("Unexpected response shape: {0}")]
    UpstreamProtocol(String),
}

impl From<BackendError> for ChainError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unregistered { .. } | BackendError::Configuration(_) => {
                ChainError::Configuration(err.to_string())
            }
            BackendError::UpstreamProtocol(msg) => ChainError::UpstreamProtocol(msg),
            other => ChainError::Other(anyhow::Error::new(other)),
        }
    }
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;
