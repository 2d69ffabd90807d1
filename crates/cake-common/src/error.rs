//! Error types for cake
//!
//! Errors are structured around how a failure must be handled during a run:
//! connectivity, missing resources, deadlines, transfer integrity and external
//! tools each get a variant carrying the context an operator needs to act on
//! it after the fact.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Substrings that mark a failure as a duplicate-creation of something that
/// already exists
const DUPLICATE_MARKERS: &[&str] = &["already exists", "AlreadyExists"];

/// Main error type for cake operations
#[derive(Debug, Error)]
pub enum Error {
    /// A remote endpoint (hypervisor API, event bus, bootstrap port) could not
    /// be reached
    #[error("connectivity error reaching {endpoint}: {message}")]
    Connectivity {
        /// Address or URL that was being contacted
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// A named resource does not exist
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Kind of resource (datacenter, folder, vm, ...)
        kind: String,
        /// The lookup key or inventory path that was searched
        key: String,
    },

    /// A deadline elapsed before a resource reached the condition sought
    #[error("timeout after {elapsed:?} waiting for {resource} with condition {condition}")]
    Timeout {
        /// Resource that was being waited on
        resource: String,
        /// Condition that was sought
        condition: String,
        /// How long the caller waited
        elapsed: Duration,
    },

    /// Byte count written did not match the source size
    #[error("problem with transfer to {destination}: expected {expected} bytes, sent {actual}")]
    Transfer {
        /// Where the payload was going
        destination: String,
        /// Source size in bytes
        expected: u64,
        /// Bytes acknowledged by the transport
        actual: u64,
    },

    /// An external program exited unsuccessfully
    #[error("{program} failed ({status}): {stderr}")]
    ExternalTool {
        /// Program name
        program: String,
        /// Exit status, rendered
        status: String,
        /// Captured stderr, trimmed
        stderr: String,
    },

    /// Configuration document is missing or malformed
    #[error("config error in {source_path}: {message}")]
    Config {
        /// File the configuration was read from
        source_path: String,
        /// Description of what's wrong
        message: String,
    },

    /// Configuration values are present but invalid
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster the configuration belongs to
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Local filesystem or socket I/O error
    #[error("io error: {source}")]
    Io {
        /// The underlying error
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a connectivity error for an endpoint
    pub fn connectivity(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connectivity {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error that names the lookup key
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(
        resource: impl Into<String>,
        condition: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self::Timeout {
            resource: resource.into(),
            condition: condition.into(),
            elapsed,
        }
    }

    /// Create a transfer integrity error
    pub fn transfer(destination: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::Transfer {
            destination: destination.into(),
            expected,
            actual,
        }
    }

    /// Create an external tool error
    pub fn external_tool(
        program: impl Into<String>,
        status: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ExternalTool {
            program: program.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a config error
    pub fn config(source_path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            source_path: source_path.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error without cluster context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error without context
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

    /// Whether this failure is a duplicate-creation of something that already
    /// exists. Callers may downgrade these to a warning and continue.
    pub fn is_benign_duplicate(&self) -> bool {
        match self {
            Error::ExternalTool { stderr, .. } => {
                DUPLICATE_MARKERS.iter().any(|m| stderr.contains(m))
            }
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 || ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// None of the run-level failure categories are retried automatically;
    /// only transient kube transport errors and internal errors are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Internal { .. } => true,
            Error::Connectivity { .. }
            | Error::NotFound { .. }
            | Error::Timeout { .. }
            | Error::Transfer { .. }
            | Error::ExternalTool { .. }
            | Error::Config { .. }
            | Error::Validation { .. }
            | Error::Io { .. }
            | Error::Serialization { .. } => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
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

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
