use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infra::InfraError;

/* ============================= KINDS ============================= */

/// Coarse classification of a [`CheckError`], carried into reports so an
/// operator can tell "could not run" apart from "object not found".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    MalformedIdentifier,
    ObjectNotFound,
    ContextClosed,
    ReconfigureFailed,
    TransientRemote,
    ClusterStateUnavailable,
    UnexpectedCheckFailure,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedIdentifier => "MalformedIdentifier",
            ErrorKind::ObjectNotFound => "ObjectNotFound",
            ErrorKind::ContextClosed => "ContextClosed",
            ErrorKind::ReconfigureFailed => "ReconfigureFailed",
            ErrorKind::TransientRemote => "TransientRemote",
            ErrorKind::ClusterStateUnavailable => "ClusterStateUnavailable",
            ErrorKind::UnexpectedCheckFailure => "UnexpectedCheckFailure",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/* ============================= ERRORS ============================= */

/// Errors raised while resolving nodes and running checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("malformed provider identifier {provider_id:?} on node {node}: {reason}")]
    MalformedIdentifier {
        node: String,
        provider_id: String,
        reason: String,
    },

    #[error("no infrastructure object at {path}: {reason}")]
    ObjectNotFound { path: String, reason: String },

    #[error("check context is closed")]
    ContextClosed,

    #[error("reconfigure failed: {cause}")]
    ReconfigureFailed { cause: String },

    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// The cluster-state accessor failed; never retried.
    #[error("cluster state unavailable: {0}")]
    ClusterStateUnavailable(String),

    #[error("unexpected check failure: {0}")]
    UnexpectedCheckFailure(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CheckError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckError::MalformedIdentifier { .. } => ErrorKind::MalformedIdentifier,
            CheckError::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            CheckError::ContextClosed => ErrorKind::ContextClosed,
            CheckError::ReconfigureFailed { .. } => ErrorKind::ReconfigureFailed,
            CheckError::TransientRemote(_) => ErrorKind::TransientRemote,
            CheckError::ClusterStateUnavailable(_) => ErrorKind::ClusterStateUnavailable,
            CheckError::UnexpectedCheckFailure(_) => ErrorKind::UnexpectedCheckFailure,
            CheckError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only transient remote errors are eligible for executor-level retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CheckError::TransientRemote(_))
    }

    pub fn object_not_found(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CheckError::ObjectNotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<InfraError> for CheckError {
    fn from(e: InfraError) -> Self {
        match e {
            InfraError::Transient(msg) => CheckError::TransientRemote(msg),
            InfraError::NotFound(what) => CheckError::object_not_found(what, "not found"),
            InfraError::SessionClosed => CheckError::ContextClosed,
            InfraError::TaskFailed(cause) => CheckError::ReconfigureFailed { cause },
            InfraError::Remote(msg) => CheckError::UnexpectedCheckFailure(msg),
        }
    }
}

/* ============================= TESTS ============================= */
