//! Error types for the manifest operator

use thiserror::Error;

/// Main error type for manifest operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed or unsupported install source specification
    #[error("config error: {0}")]
    Config(String),

    /// No pull secret matched the credential selector
    #[error("no auth secret found")]
    NoAuthSecretFound,

    /// Invalid pull-secret payload or keychain construction failure
    #[error("auth error: {0}")]
    Auth(String),

    /// Registry pull or artifact extraction failure
    #[error("registry error: {0}")]
    Registry(String),

    /// Chart or kustomization rendering failure
    #[error("render error: {0}")]
    Render(String),

    /// One or more server-side apply operations failed
    #[error("apply error: {0}")]
    Apply(#[from] MultiError),

    /// Remote cluster connection could not be established
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error against the artifact or rendered-manifest cache
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The install worker pool is no longer accepting jobs
    #[error("install worker pool is shut down")]
    WorkerPoolClosed,
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an auth error with the given message
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a render error with the given message
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Create a cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Aggregate of independent failures collected from a fan-out operation.
///
/// Server-side apply runs one task per object; every failure is kept so a
/// single bad object does not hide the others.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<String>,
}

impl std::error::Error for MultiError {}

impl MultiError {
    /// Build from a list of failure messages
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    /// Number of aggregated failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True if no failures were aggregated
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure(s): ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
