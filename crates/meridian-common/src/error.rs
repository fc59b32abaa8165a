//! Error types for the Meridian operator
//!
//! Errors are structured with fields to aid debugging in production. Store
//! outcomes that callers branch on ("already exists", "not found",
//! "conflict") are distinct variants so they never need string matching.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Meridian operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object with the same identity already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// The addressed object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// Optimistic-concurrency conflict on write
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Namespaced name of the object
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// Validation error for an Installation spec
    #[error("validation error for {installation}: {message}")]
    Validation {
        /// Name of the Installation with invalid configuration
        installation: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.namespacePrefix")
        field: Option<String>,
    },

    /// A required external secret or config value is missing or malformed
    #[error("configuration error [{product}]: {message}")]
    Configuration {
        /// Product whose configuration is incomplete
        product: String,
        /// Description of what is missing
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Account directory call failed
    #[error("directory error [{directory}]: {message}")]
    Directory {
        /// Directory that reported the failure (e.g., "source", "target")
        directory: String,
        /// Description of what failed
        message: String,
    },

    /// The reconcile token was cancelled while an external call was pending
    #[error("operation cancelled [{context}]")]
    Cancelled {
        /// Operation that was interrupted
        context: String,
    },

    /// The reconcile deadline expired while an external call was pending
    #[error("deadline exceeded [{context}] after {timeout:?}")]
    DeadlineExceeded {
        /// Operation that was interrupted
        context: String,
        /// The deadline budget that was exhausted
        timeout: Duration,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "store")
        context: String,
    },
}

impl Error {
    /// Create an already-exists error for the given object
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error for the given object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a write conflict error for the given object
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without installation context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            installation: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with installation context and field path
    pub fn validation_for_field(
        installation: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            installation: installation.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error for a product
    pub fn configuration(product: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            product: product.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a directory error
    pub fn directory(directory: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Directory {
            directory: directory.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when a create failed because the object is already present
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// True when the addressed object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for optimistic-concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors need a fix from
    /// outside before a retry can succeed. Store conflicts, missing objects
    /// and expired deadlines clear up on a later invocation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::AlreadyExists { .. } => false,
            Error::NotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Configuration { .. } => false,
            Error::Serialization { .. } => false,
            Error::Directory { .. } => true,
            Error::Cancelled { .. } => false,
            Error::DeadlineExceeded { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// True when the reconcile was cancelled or ran out of time, so the
    /// caller must stop rather than skip to its next item
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::DeadlineExceeded { .. })
    }

    /// True for kube transport failures worth retrying within a single call
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Kube { .. }) && self.is_retryable()
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Cancelled { context } => Some(context),
            Error::DeadlineExceeded { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
