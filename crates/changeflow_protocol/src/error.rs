//! API error type shared by every service.
//!
//! Each failure carries a [`Code`] from a fixed set and a human-readable
//! message. Storage, parse and evaluation errors are converted at the crate
//! boundary; nothing below the service layer decides a code on its own.

use changeflow_ids::IdParseError;
use std::fmt;

/// Canonical error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    AlreadyExists,
    ResourceExhausted,
    Aborted,
    Cancelled,
    DeadlineExceeded,
    Unimplemented,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::NotFound => "NOT_FOUND",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::Aborted => "ABORTED",
            Code::Cancelled => "CANCELLED",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by every API operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: Code,
    pub message: String,
}

impl ApiError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<IdParseError> for ApiError {
    fn from(err: IdParseError) -> Self {
        ApiError::invalid_argument(err.message())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal(format!("failed to marshal payload, error: {}", err))
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Wraps an arbitrary error as `Internal` with a `failed to <what>` prefix.
pub trait ErrorContext<T> {
    fn internal_context(self, what: &str) -> ApiResult<T>;
}

impl<T, E: fmt::Display> ErrorContext<T> for std::result::Result<T, E> {
    fn internal_context(self, what: &str) -> ApiResult<T> {
        self.map_err(|e| ApiError::internal(format!("failed to {}, error: {}", what, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = ApiError::not_found("issue 7 not found");
        assert_eq!(err.to_string(), "NOT_FOUND: issue 7 not found");
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_id_parse_error_is_invalid_argument() {
        let err: ApiError = changeflow_ids::IssueName::parse("projects/p1").unwrap_err().into();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn test_internal_context() {
        let res: Result<(), &str> = Err("boom");
        let err = res.internal_context("get sheet").unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert_eq!(err.message, "failed to get sheet, error: boom");
    }
}
