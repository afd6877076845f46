//! Error taxonomy shared by the gateway and the provisioner.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// More than one resource matched a composite key that must be unique.
    #[error("constraint violation: {count} {kind} resources match {selector}")]
    ConstraintViolation {
        kind: &'static str,
        selector: String,
        count: usize,
    },

    /// Shard metadata must name exactly one operator; multiple selectors are
    /// a known, unsupported configuration.
    #[error("unsupported configuration: expected exactly one operator in shard metadata, found {0}")]
    UnsupportedOperatorCount(usize),

    #[error("invalid shard metadata: {0}")]
    InvalidShardMetadata(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name}: update conflict persisted after {attempts} attempts")]
    Conflict {
        kind: &'static str,
        name: String,
        attempts: usize,
    },

    /// Persisted owner has no uid/name yet, so no owner reference can be built.
    #[error("{kind} {name} has not been persisted; cannot reference it as owner")]
    MissingOwner { kind: &'static str, name: String },

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("watch: {0}")]
    Watch(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether re-invoking the failed operation unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(_) | Error::Watch(_) | Error::Conflict { .. } | Error::NotFound { .. } => true,
            Error::ConstraintViolation { .. }
            | Error::UnsupportedOperatorCount(_)
            | Error::InvalidShardMetadata(_)
            | Error::MissingOwner { .. }
            | Error::Serialization(_) => false,
        }
    }

    /// Short stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConstraintViolation { .. } => "constraint_violation",
            Error::UnsupportedOperatorCount(_) | Error::InvalidShardMetadata(_) => "configuration",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::MissingOwner { .. } => "missing_owner",
            Error::Kube(_) => "kube",
            Error::Watch(_) => "watch",
            Error::Serialization(_) => "serialization",
        }
    }
}
