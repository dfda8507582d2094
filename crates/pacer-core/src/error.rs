//! Error types shared by the async primitives.

use std::time::Duration;

use thiserror::Error;

/// Why a wrapped execution did not produce a value.
///
/// `Timeout` counts as a regular failed attempt for retry purposes.
/// `TotalTimeout` is terminal: once the overall budget is spent no further
/// attempt is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError<E> {
    /// The wrapped function returned an error.
    #[error("{0}")]
    Failed(E),

    /// A single attempt exceeded `max_execution_time`.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// All attempts plus backoff waits exceeded `max_total_execution_time`.
    #[error("total execution time exceeded {0:?}")]
    TotalTimeout(Duration),
}

impl<E> ExecutionError<E> {
    /// The error returned by the wrapped function, if that is what happened.
    pub fn as_failed(&self) -> Option<&E> {
        match self {
            ExecutionError::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_failed(self) -> Option<E> {
        match self {
            ExecutionError::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout(_) | ExecutionError::TotalTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_displays_inner_error() {
        let err: ExecutionError<String> = ExecutionError::Failed("boom".to_string());
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.as_failed().map(String::as_str), Some("boom"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeouts_are_classified() {
        let err: ExecutionError<String> = ExecutionError::Timeout(Duration::from_millis(50));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
        assert_eq!(err.into_failed(), None);

        let err: ExecutionError<String> = ExecutionError::TotalTimeout(Duration::from_secs(1));
        assert!(err.is_timeout());
    }
}
