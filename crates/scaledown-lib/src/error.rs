//! Error taxonomy surfaced by the scale-down core

use crate::cloudprovider::CloudProviderError;
use crate::cluster::ApiError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutoscalerError>;

/// Closed set of error classes every component tags its failures with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Any failure reported by the node-group adapter
    CloudProviderError,
    /// Any failure from the orchestrator's API (evict, get, list, patch)
    ApiCallError,
    /// Invariant violation
    InternalError,
    /// Failure expected to go away, e.g. a sibling in an atomic batch failed
    TransientError,
    /// Simulation failure leaving the planner's state inconsistent
    UnexpectedScaleDownStateError,
    /// Optional cloud operation not offered by the provider
    NotImplemented,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CloudProviderError => "cloudProviderError",
            ErrorKind::ApiCallError => "apiCallError",
            ErrorKind::InternalError => "internalError",
            ErrorKind::TransientError => "transientError",
            ErrorKind::UnexpectedScaleDownStateError => "unexpectedScaleDownStateError",
            ErrorKind::NotImplemented => "notImplemented",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct AutoscalerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AutoscalerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cloud_provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CloudProviderError, message)
    }

    pub fn api_call(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApiCallError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientError, message)
    }

    pub fn unexpected_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnexpectedScaleDownStateError, message)
    }

    /// Prepends context while keeping the kind
    pub fn with_prefix(self, prefix: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}: {}", prefix, self.message),
        }
    }
}

impl From<CloudProviderError> for AutoscalerError {
    fn from(err: CloudProviderError) -> Self {
        match err {
            CloudProviderError::NotImplemented => {
                Self::new(ErrorKind::NotImplemented, err.to_string())
            }
            other => Self::cloud_provider(other.to_string()),
        }
    }
}

impl From<ApiError> for AutoscalerError {
    fn from(err: ApiError) -> Self {
        Self::api_call(err.to_string())
    }
}
