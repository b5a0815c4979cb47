//! Error handling for isomer.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Defines all possible errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error reading or writing engine files.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing a YAML settings or manifest file.
    #[error("Invalid YAML format: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Error encoding or decoding JSON documents.
    #[error("Invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings or manifest content that parsed but is not usable.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A service id that the manifest does not define.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Error when a dependency reference is undefined in the manifest.
    #[error("Service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// Error when the dependency graph contains a cycle.
    #[error("Detected dependency cycle: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },

    /// A downloaded artifact did not match its published hash.
    #[error("Integrity check failed for '{service}': expected {expected}, got {actual}")]
    Integrity {
        /// Service whose artifact failed verification.
        service: String,
        /// Expected sha256 (hex), empty when none was published.
        expected: String,
        /// Sha256 (hex) of the bytes actually received.
        actual: String,
    },

    /// Neither the manifest nor the release index publishes a hash for the artifact.
    #[error(
        "No published sha256 for '{service}' {version} on {platform}; \
         point release_index_url at a checksums index that lists it"
    )]
    MissingChecksum {
        /// Service whose artifact cannot be verified.
        service: String,
        /// Release version that was requested.
        version: String,
        /// Platform key such as `linux-x86_64`.
        platform: String,
    },

    /// Transfer failure. Callers may retry.
    #[error("Network error while {context}: {message}")]
    Network {
        /// What the engine was doing.
        context: String,
        /// Underlying transport message.
        message: String,
    },

    /// A verified archive could not be unpacked.
    #[error("Failed to unpack archive for '{service}': {message}")]
    Archive {
        /// Service owning the archive.
        service: String,
        /// Description of the failure.
        message: String,
    },

    /// A service did not pass its health probe within the startup window.
    #[error("Service '{service}' did not become healthy within {timeout:?}")]
    StartupTimeout {
        /// The service that timed out.
        service: String,
        /// The startup window that elapsed.
        timeout: Duration,
    },

    /// A service process exited while it was expected to keep running.
    #[error("Service '{service}' exited unexpectedly: {status}")]
    ProcessCrash {
        /// The service that exited.
        service: String,
        /// Exit status description.
        status: String,
    },

    /// An operation was requested while its preconditions do not hold.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The chain daemon answered a JSON-RPC call with an error object.
    #[error("Chain RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStart {
        /// The service that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStop {
        /// The service that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Another engine already owns the data root.
    #[error("Data root is locked by another isomer instance ({0})")]
    InstanceLocked(PathBuf),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoison(String),
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    /// Converts a `std::sync::PoisonError` into an `EngineError`.
    fn from(err: std::sync::PoisonError<T>) -> Self {
        EngineError::MutexPoison(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let context = match err.url() {
            Some(url) => format!("requesting {url}"),
            None => "performing HTTP request".to_string(),
        };
        EngineError::Network {
            context,
            message: err.to_string(),
        }
    }
}

impl EngineError {
    /// Whether a caller can reasonably retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Network { .. })
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
