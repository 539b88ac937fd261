//! Failure classification for retry eligibility.
//!
//! Retryability is a pure function of a closed enumeration, never of
//! string or domain sniffing on the underlying error.

use std::time::Duration;

/// Category assigned to an operation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, DNS failure, connection loss: worth retrying.
    TransientNetwork,
    /// Remote rate limit, optionally with a server-provided retry-after hint.
    RateLimited { retry_after: Option<Duration> },
    /// 5xx-style dependency failure.
    ServerError,
    /// Malformed input or otherwise caller-caused; retrying cannot help.
    ClientError,
    /// Anything else that must not be retried (auth failures, offline).
    NonRetryable,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNetwork
                | ErrorClass::RateLimited { .. }
                | ErrorClass::ServerError
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorClass::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Maps a call-site error type onto [`ErrorClass`].
pub trait ErrorClassifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorClass;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Sane default classification for common error types.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl ErrorClassifier<std::io::Error> for DefaultClassifier {
    fn classify(&self, error: &std::io::Error) -> ErrorClass {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted => ErrorClass::TransientNetwork,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => ErrorClass::ClientError,
            // NotConnected means "not on the internet at all": retrying in a
            // tight loop would only burn battery; the offline queue owns that.
            ErrorKind::NotConnected | ErrorKind::PermissionDenied => ErrorClass::NonRetryable,
            _ => ErrorClass::NonRetryable,
        }
    }
}

impl ErrorClassifier<crate::Error> for DefaultClassifier {
    fn classify(&self, error: &crate::Error) -> ErrorClass {
        match error {
            crate::Error::RateLimited { retry_after, .. } => ErrorClass::RateLimited {
                retry_after: *retry_after,
            },
            crate::Error::CircuitOpen { .. } => ErrorClass::NonRetryable,
            crate::Error::Storage(_) | crate::Error::Io(_) => ErrorClass::TransientNetwork,
            _ => ErrorClass::NonRetryable,
        }
    }
}
