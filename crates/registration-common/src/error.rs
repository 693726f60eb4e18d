//! Error types for the registration control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like cluster names
//! and underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for registration operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for object specs
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Certificate or CSR processing error
    #[error("certificate error for {cluster}: {message}")]
    Certificate {
        /// Name of the cluster whose credential failed
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Fatal agent misconfiguration; the process should exit non-zero
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's misconfigured
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "rotator", "webhook")
        context: String,
    },
}

impl Error {
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

    /// Create a certificate error with cluster context
    pub fn certificate(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Certificate {
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

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
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

    /// Check if this error is retryable.
    ///
    /// A failed uid/resourceVersion precondition shows up as a 409; the next
    /// resync observes the new state, so conflicts count as retryable.
    /// Validation and serialization errors require a config fix and are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Certificate { .. } => true,
            Error::Serialization { .. } => false,
            Error::Configuration { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with one
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Certificate { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

/// Collect a list of errors into a single aggregated error, or Ok if empty.
///
/// Controllers run several independent steps per sync and report all failures
/// at once rather than aborting on the first.
pub fn aggregate(errs: Vec<Error>) -> Result<(), Error> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.into_iter().next().expect("len checked")),
        _ => {
            let joined = errs
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::internal_with_context("aggregate", joined))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::validation("url \"http://insecure\" is invalid in client configs");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("invalid in client configs"));
    }

    #[test]
    fn validation_error_carries_cluster_context() {
        let err = Error::validation_for("cluster1", "leaseDurationSeconds must be positive");
        assert_eq!(err.cluster(), Some("cluster1"));
        assert!(err.to_string().contains("cluster1"));
    }

    #[test]
    fn certificate_errors_are_retryable() {
        // A denied CSR backs off and retries with a new request on the next sync
        let err = Error::certificate("cluster1", "csr denied by hub");
        assert!(err.is_retryable());
        assert_eq!(err.cluster(), Some("cluster1"));
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let err = Error::configuration("bootstrap kubeconfig is missing");
        assert!(!err.is_retryable());
        assert_eq!(err.cluster(), None);
    }

    #[test]
    fn conflict_is_benign() {
        let err = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            }),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            }),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn aggregate_of_nothing_is_ok() {
        assert!(aggregate(vec![]).is_ok());
    }

    #[test]
    fn aggregate_preserves_single_error() {
        let result = aggregate(vec![Error::validation("bad spec")]);
        match result {
            Err(Error::Validation { message, .. }) => assert_eq!(message, "bad spec"),
            _ => panic!("expected the original Validation error"),
        }
    }

    #[test]
    fn aggregate_joins_multiple_errors() {
        let result = aggregate(vec![
            Error::internal("first failure"),
            Error::internal("second failure"),
        ]);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("first failure"));
        assert!(msg.contains("second failure"));
    }
}
