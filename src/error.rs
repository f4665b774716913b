//! Crate-wide error taxonomy (§7).

use thiserror::Error;

/// The seven status kinds shared by the provider wire protocol (§6.1) and the
/// call router (§4.6), plus the two BT-local kinds used inside custom nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    Internal,
    MissingBlackboardContext,
    MissingPort,
}

impl ErrorKind {
    /// Leading diagnostic token per §8 property 3 ("failure carries a
    /// diagnostic whose leading token names the first-failing rule").
    pub fn token(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::MissingBlackboardContext => "MISSING_BLACKBOARD_CONTEXT",
            ErrorKind::MissingPort => "MISSING_PORT",
        }
    }
}

#[derive(Debug, Error)]
#[error("{}: {message}", kind.token())]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// `Status.code` from the provider wire protocol (§6.1). Kept distinct from
/// [`ErrorKind`] at the type level even though the variant set is identical,
/// because it crosses the wire and must round-trip through `bincode`
/// untouched by local-only kinds (`MissingBlackboardContext`, `MissingPort`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl From<StatusCode> for ErrorKind {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Ok => ErrorKind::Internal, // caller should never convert Ok
            StatusCode::InvalidArgument => ErrorKind::InvalidArgument,
            StatusCode::NotFound => ErrorKind::NotFound,
            StatusCode::FailedPrecondition => ErrorKind::FailedPrecondition,
            StatusCode::Unavailable => ErrorKind::Unavailable,
            StatusCode::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            StatusCode::Internal => ErrorKind::Internal,
        }
    }
}

impl From<ErrorKind> for StatusCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidArgument => StatusCode::InvalidArgument,
            ErrorKind::NotFound => StatusCode::NotFound,
            ErrorKind::FailedPrecondition => StatusCode::FailedPrecondition,
            ErrorKind::Unavailable => StatusCode::Unavailable,
            ErrorKind::DeadlineExceeded => StatusCode::DeadlineExceeded,
            // Local-only kinds collapse to Internal when crossing the wire boundary.
            ErrorKind::Internal
            | ErrorKind::MissingBlackboardContext
            | ErrorKind::MissingPort => StatusCode::Internal,
        }
    }
}
