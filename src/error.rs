//! Error types for the GitOpsSet controller.
//!
//! The hierarchy mirrors the failure classes a reconcile can hit: controller
//! configuration, generators (including the retryable not-ready signal),
//! template rendering, cluster writes and status persistence.

use std::path::PathBuf;
use thiserror::Error;

use crate::api::GeneratorKind;

/// The main error type for the GitOpsSet controller.
#[derive(Debug, Error)]
pub enum GitOpsSetError {
    /// Controller configuration errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generator errors.
    #[error(transparent)]
    Generator(#[from] GeneratorError),

    /// Template rendering errors.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Cluster API errors. The message is the API server's own text.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// GitOpsSet persistence errors.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Controller configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A generator name is not one of the known kinds.
    #[error("Unknown generator kind: {name}")]
    UnknownGenerator {
        /// The unrecognised name.
        name: String,
    },
}

/// Errors produced while generating elements.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The referenced source exists but has not produced an artifact yet.
    ///
    /// This is not a fault: the reconcile waits for the source to update.
    #[error("waiting for artifact from {source_ref}")]
    NotReady {
        /// `Kind/namespace/name` of the source.
        source_ref: String,
    },

    /// A generator kind used by the set is not enabled in this controller.
    #[error("generator {kind} not enabled")]
    NotEnabled {
        /// The missing generator kind.
        kind: GeneratorKind,
    },

    /// A referenced object could not be found.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the referenced object.
        kind: String,
        /// Namespace of the referenced object.
        namespace: String,
        /// Name of the referenced object.
        name: String,
    },

    /// The generator spec is invalid.
    #[error("invalid {kind} generator: {message}")]
    InvalidSpec {
        /// Generator kind.
        kind: GeneratorKind,
        /// Description of the problem.
        message: String,
    },

    /// An artifact could not be fetched or unpacked.
    #[error("failed to fetch artifact from {url}: {message}")]
    Fetch {
        /// Artifact URL.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// An HTTP request made by a generator failed.
    #[error("request to {url} failed: {message}")]
    Http {
        /// Request URL.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// A fetched document could not be parsed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path or URL of the document.
        path: String,
        /// Description of the parse error.
        message: String,
    },

    /// Reading an object from the cluster failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Template rendering errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Executing a template expression failed.
    #[error("failed to render template for GitOpsSet {set} at {path}: {message}")]
    Render {
        /// `namespace/name` of the owning set.
        set: String,
        /// Field path inside the set.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// A repeat expression could not be parsed or evaluated.
    #[error("invalid repeat expression {expression:?} in GitOpsSet {set} at {path}: {message}")]
    Repeat {
        /// `namespace/name` of the owning set.
        set: String,
        /// Field path inside the set.
        path: String,
        /// The offending expression.
        expression: String,
        /// Description of the failure.
        message: String,
    },

    /// The delimiters annotation is malformed.
    #[error("invalid template delimiters {value:?} on GitOpsSet {set}: expected \"<open>,<close>\"")]
    Delimiters {
        /// `namespace/name` of the owning set.
        set: String,
        /// The annotation value.
        value: String,
    },

    /// The rendered output could not be parsed as a resource.
    #[error("failed to parse rendered template for GitOpsSet {set} at {path}: {message}")]
    Parse {
        /// `namespace/name` of the owning set.
        set: String,
        /// Field path inside the set.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// Resolving the scope of a rendered kind failed.
    #[error("failed to resolve scope of {kind} for GitOpsSet {set}: {source}")]
    Scope {
        /// `namespace/name` of the owning set.
        set: String,
        /// Resource kind.
        kind: String,
        /// Underlying error.
        source: ClusterError,
    },
}

/// Cluster API errors.
///
/// Variants carrying a `message` display it verbatim so that the API server's
/// own text (RBAC denials, conflicts) reaches the set's condition unchanged.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The object already exists.
    #[error("{message}")]
    AlreadyExists {
        /// API server message.
        message: String,
    },

    /// The object was not found.
    #[error("{message}")]
    NotFound {
        /// API server message.
        message: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("{message}")]
    Forbidden {
        /// API server message.
        message: String,
    },

    /// An optimistic-concurrency conflict.
    #[error("{message}")]
    Conflict {
        /// API server message.
        message: String,
    },

    /// Any other API error.
    #[error("{message}")]
    Api {
        /// HTTP status code.
        code: u16,
        /// API server message.
        message: String,
    },

    /// The object is malformed and cannot be sent to the API server.
    #[error("invalid object: {message}")]
    InvalidObject {
        /// Description of the problem.
        message: String,
    },

    /// A client for the requested identity could not be built.
    #[error("failed to build client for {identity}: {message}")]
    Client {
        /// Impersonated identity.
        identity: String,
        /// Description of the failure.
        message: String,
    },
}

/// GitOpsSet persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent writer updated the set first.
    #[error("conflict updating GitOpsSet {namespace}/{name}: {message}")]
    Conflict {
        /// Namespace of the set.
        namespace: String,
        /// Name of the set.
        name: String,
        /// API server message.
        message: String,
    },

    /// The set disappeared while being updated.
    #[error("GitOpsSet {namespace}/{name} not found")]
    NotFound {
        /// Namespace of the set.
        namespace: String,
        /// Name of the set.
        name: String,
    },

    /// The object store rejected the request.
    #[error("object store error: {message}")]
    Api {
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("GitOpsSet serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, GitOpsSetError>;

impl GitOpsSetError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is the generator not-ready signal.
    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(self, Self::Generator(GeneratorError::NotReady { .. }))
    }

    /// Returns true if retrying the reconcile soon is likely to help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Conflict { .. })
                | Self::Cluster(ClusterError::Conflict { .. })
                | Self::Generator(GeneratorError::Http { .. } | GeneratorError::Fetch { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Store(StoreError::Conflict { .. }) | Self::Cluster(ClusterError::Conflict { .. }) => {
                Some(1)
            }
            Self::Generator(GeneratorError::Http { .. } | GeneratorError::Fetch { .. }) => Some(10),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl GeneratorError {
    /// Creates an invalid-spec error.
    #[must_use]
    pub fn invalid(kind: GeneratorKind, message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            kind,
            message: message.into(),
        }
    }

    /// Creates an HTTP error.
    #[must_use]
    pub fn http(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an artifact fetch error.
    #[must_use]
    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.into(),
        }
    }
}

impl ClusterError {
    /// Creates an error for an API response with the given status code.
    #[must_use]
    pub fn from_status(code: u16, reason: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match (code, reason) {
            (409, "AlreadyExists") => Self::AlreadyExists { message },
            (409, _) => Self::Conflict { message },
            (404, _) => Self::NotFound { message },
            (403, _) => Self::Forbidden { message },
            _ => Self::Api { code, message },
        }
    }

    /// Returns true if this error means the object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl StoreError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
