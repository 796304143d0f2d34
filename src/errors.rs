use std::{fmt, time::Duration};

use serde::Serialize;
use thiserror::Error;

/// Whether a backend failure can be fixed by trying again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Finer-grained cause of a backend failure, independent of the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    ConnectionReset,
    ServiceUnavailable,
    SessionExpired,
    LeaderSwitch,
    Deadlock,
    LockContention,
    Interrupted,
    ConstraintViolation,
    SyntaxError,
    Authorization,
    ReadOnly,
    TypeMismatch,
    Other,
}

impl FailureCode {
    /// The classification a code carries unless the transport says otherwise.
    pub fn default_kind(self) -> FailureKind {
        match self {
            FailureCode::ConnectionReset
            | FailureCode::ServiceUnavailable
            | FailureCode::SessionExpired
            | FailureCode::LeaderSwitch
            | FailureCode::Deadlock
            | FailureCode::LockContention => FailureKind::Transient,
            FailureCode::Interrupted
            | FailureCode::ConstraintViolation
            | FailureCode::SyntaxError
            | FailureCode::Authorization
            | FailureCode::ReadOnly
            | FailureCode::TypeMismatch
            | FailureCode::Other => FailureKind::Permanent,
        }
    }

    /// Codes after which the underlying connection must not be reused.
    pub fn invalidates_session(self) -> bool {
        matches!(
            self,
            FailureCode::ConnectionReset
                | FailureCode::ServiceUnavailable
                | FailureCode::SessionExpired
                | FailureCode::LeaderSwitch
                | FailureCode::Interrupted
        )
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A classified failure reported by a transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendFailure {
    pub kind: FailureKind,
    pub code: FailureCode,
    pub message: String,
    pub session_invalid: bool,
}

impl BackendFailure {
    pub fn new<T: Into<String>>(code: FailureCode, msg: T) -> Self {
        Self {
            kind: code.default_kind(),
            code,
            message: msg.into(),
            session_invalid: code.invalidates_session(),
        }
    }

    pub fn transient<T: Into<String>>(code: FailureCode, msg: T) -> Self {
        Self {
            kind: FailureKind::Transient,
            ..Self::new(code, msg)
        }
    }

    pub fn permanent<T: Into<String>>(code: FailureCode, msg: T) -> Self {
        Self {
            kind: FailureKind::Permanent,
            ..Self::new(code, msg)
        }
    }

    pub fn connection_reset<T: Into<String>>(msg: T) -> Self {
        Self::new(FailureCode::ConnectionReset, msg)
    }

    pub fn service_unavailable<T: Into<String>>(msg: T) -> Self {
        Self::new(FailureCode::ServiceUnavailable, msg)
    }

    pub fn constraint<T: Into<String>>(msg: T) -> Self {
        Self::new(FailureCode::ConstraintViolation, msg)
    }

    pub fn syntax<T: Into<String>>(msg: T) -> Self {
        Self::new(FailureCode::SyntaxError, msg)
    }

    /// Marks the connection that produced this failure as unusable.
    pub fn with_session_invalid(mut self, invalid: bool) -> Self {
        self.session_invalid = invalid;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Error kinds surfaced to the HTTP layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PoolExhausted,
    PoolClosed,
    Transient,
    Permanent,
    UnmappableType,
    DeadlineExceeded,
    Validation,
    Configuration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    ClientError,
    ServerError,
}

/// Error type for graph-db-api operations.
#[derive(Debug, Error)]
pub enum GraphDbError {
    #[error("pool exhausted: no session became idle within {waited:?} (max {max_size})")]
    PoolExhausted { waited: Duration, max_size: usize },
    #[error("pool closed")]
    PoolClosed,
    #[error("transient failure: {0}")]
    Transient(BackendFailure),
    #[error("{}", describe_permanent(.failure, .retries_exhausted))]
    Permanent {
        failure: BackendFailure,
        retries_exhausted: Option<u32>,
    },
    #[error("unmappable type: {0}")]
    UnmappableType(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

fn describe_permanent(failure: &BackendFailure, retries_exhausted: &Option<u32>) -> String {
    match retries_exhausted {
        Some(attempts) => {
            format!("permanent failure: retries exhausted after {attempts} attempts: {failure}")
        }
        None => format!("permanent failure: {failure}"),
    }
}

impl GraphDbError {
    pub fn pool_exhausted(waited: Duration, max_size: usize) -> Self {
        GraphDbError::PoolExhausted { waited, max_size }
    }

    pub fn unmappable<T: Into<String>>(msg: T) -> Self {
        GraphDbError::UnmappableType(msg.into())
    }

    pub fn deadline<T: Into<String>>(msg: T) -> Self {
        GraphDbError::DeadlineExceeded(msg.into())
    }

    pub fn validation<T: Into<String>>(msg: T) -> Self {
        GraphDbError::Validation(msg.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        GraphDbError::Configuration(msg.into())
    }

    /// Wraps a backend failure according to its own classification.
    pub fn from_failure(failure: BackendFailure) -> Self {
        match failure.kind {
            FailureKind::Transient => GraphDbError::Transient(failure),
            FailureKind::Permanent => GraphDbError::Permanent {
                failure,
                retries_exhausted: None,
            },
        }
    }

    /// Escalation of a transient failure that survived every retry.
    pub fn exhausted(failure: BackendFailure, attempts: u32) -> Self {
        GraphDbError::Permanent {
            failure,
            retries_exhausted: Some(attempts),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphDbError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            GraphDbError::PoolClosed => ErrorKind::PoolClosed,
            GraphDbError::Transient(_) => ErrorKind::Transient,
            GraphDbError::Permanent { .. } => ErrorKind::Permanent,
            GraphDbError::UnmappableType(_) => ErrorKind::UnmappableType,
            GraphDbError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            GraphDbError::Validation(_) => ErrorKind::Validation,
            GraphDbError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn failure(&self) -> Option<&BackendFailure> {
        match self {
            GraphDbError::Transient(failure) | GraphDbError::Permanent { failure, .. } => {
                Some(failure)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphDbError::Transient(_))
    }

    pub fn retries_exhausted(&self) -> Option<u32> {
        match self {
            GraphDbError::Permanent {
                retries_exhausted, ..
            } => *retries_exhausted,
            _ => None,
        }
    }

    /// Client errors are the caller's to fix; server errors are ours or the database's.
    pub fn status_category(&self) -> StatusCategory {
        if self.http_status() < 500 {
            StatusCategory::ClientError
        } else {
            StatusCategory::ServerError
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GraphDbError::Validation(_) => 422,
            GraphDbError::Permanent {
                retries_exhausted: Some(_),
                ..
            } => 503,
            GraphDbError::Permanent { failure, .. } => match failure.code {
                FailureCode::Authorization => 403,
                FailureCode::ConstraintViolation => 409,
                _ => 400,
            },
            GraphDbError::PoolExhausted { .. }
            | GraphDbError::PoolClosed
            | GraphDbError::Transient(_) => 503,
            GraphDbError::DeadlineExceeded(_) => 504,
            GraphDbError::UnmappableType(_) | GraphDbError::Configuration(_) => 500,
        }
    }
}
