use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    runtime::types::RuntimeError,
    tasks::types::{JobType, ServerStatus},
};

/// Stable tag carried by every error so callers can branch without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidTransition,
    PreconditionFailed,
    ResourceExhausted,
    PathTraversal,
    ProtectedFile,
    SecurityThreat,
    PayloadTooLarge,
    ArchiveTooLarge,
    NotFound,
    PermissionDenied,
    Timeout,
    StreamError,
    RuntimeUnavailable,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot {op} server {server_id} while it is {status}")]
    InvalidTransition {
        server_id: Uuid,
        status: ServerStatus,
        op: JobType,
    },
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("no free host port in {floor}-{ceiling}")]
    ResourceExhausted { floor: u16, ceiling: u16 },
    #[error("path escapes the server root: {0}")]
    PathTraversal(String),
    #[error("refusing to modify protected file {0}")]
    ProtectedFile(String),
    #[error("content matches known malicious signature {0}")]
    SecurityThreat(String),
    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("archive expands past the {limit} byte ceiling")]
    ArchiveTooLarge { limit: u64 },
    #[error("server {0} not found")]
    ServerNotFound(Uuid),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("container {0} not found")]
    ContainerNotFound(String),
    #[error("file {0} not found")]
    FileNotFound(String),
    #[error("directory {0} not found")]
    DirectoryNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("exec stream error: {0}")]
    StreamError(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("{cause}; rollback failed: {}", failures.join("; "))]
    RollbackFailed {
        cause: Box<Error>,
        failures: Vec<String>,
    },
    #[error("{context}: {message}")]
    Unknown { context: String, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn unknown(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Unknown {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::PathTraversal(_) => ErrorKind::PathTraversal,
            Error::ProtectedFile(_) => ErrorKind::ProtectedFile,
            Error::SecurityThreat(_) => ErrorKind::SecurityThreat,
            Error::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Error::ArchiveTooLarge { .. } => ErrorKind::ArchiveTooLarge,
            Error::ServerNotFound(_)
            | Error::JobNotFound(_)
            | Error::ContainerNotFound(_)
            | Error::FileNotFound(_)
            | Error::DirectoryNotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::StreamError(_) => ErrorKind::StreamError,
            Error::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            Error::RollbackFailed { cause, .. } => cause.kind(),
            Error::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Lines of diagnostic detail beyond the message, innermost last.
    pub fn trace(&self) -> Vec<String> {
        match self {
            Error::RollbackFailed { cause, failures } => {
                let mut trace = vec![format!("cause: {cause}")];
                trace.extend(failures.iter().map(|f| format!("rollback: {f}")));
                trace
            }
            Error::Unknown { context, message } => vec![context.clone(), message.clone()],
            _ => Vec::new(),
        }
    }

    /// Transient failures leave server state untouched so a re-enqueue can retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RuntimeUnavailable | ErrorKind::Timeout
        )
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(message) => Error::RuntimeUnavailable(message),
            RuntimeError::NotFound(message) => Error::ContainerNotFound(message),
            RuntimeError::Timeout(after) => Error::Timeout(after),
            other => Error::unknown("container runtime", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_failure_keeps_cause_kind_and_lists_failures() {
        let err = Error::RollbackFailed {
            cause: Box::new(Error::ResourceExhausted {
                floor: 30000,
                ceiling: 30001,
            }),
            failures: vec!["remove data directory: busy".to_string()],
        };

        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(err.trace().len(), 2);
        assert!(err.to_string().contains("rollback failed"));
    }

    #[test]
    fn runtime_errors_map_to_taxonomy() {
        let err: Error = RuntimeError::Unavailable("socket closed".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
        assert!(err.is_transient());

        let err: Error = RuntimeError::NotFound("abc".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
