//! Error types for the deployment verifier.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for verification runs.
#[derive(Error, Debug)]
pub enum Error {
    /// One or more required tools are not on PATH.
    #[error("required tools not found on PATH: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    /// Run configuration is invalid or could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// A manifest path does not exist.
    #[error("manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    /// An external command could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The cluster could not be created.
    #[error("failed to provision cluster {cluster}: {reason}")]
    Provisioning { cluster: String, reason: String },

    /// A readiness barrier reached its deadline.
    #[error("{subject} did not become {condition} within {deadline:?}")]
    BarrierTimedOut {
        subject: String,
        condition: String,
        deadline: Duration,
    },

    /// A readiness barrier observed an unrecoverable failure.
    #[error("{subject} failed: {reason}")]
    BarrierFailed { subject: String, reason: String },

    /// Certificate material could not be generated.
    #[error("certificate generation failed: {0}")]
    Certificate(String),

    /// Credentials could not be read from the cluster secret.
    #[error("credential retrieval failed: {0}")]
    Credentials(String),

    /// The port-forward tunnel failed to start or become usable.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// The application endpoint did not answer.
    #[error("endpoint {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for verifier operations.
pub type Result<T> = std::result::Result<T, Error>;
