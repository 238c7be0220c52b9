use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorErrorKind {
    /// The call did not finish within the executor timeout.
    Timeout,
    /// Connection-level failure; safe to retry once.
    Transport,
    /// The backend rejected the request; retrying would fail the same way.
    Inference,
}

impl ExecutorErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorErrorKind::Timeout => "executor_timeout",
            ExecutorErrorKind::Transport => "executor_transport",
            ExecutorErrorKind::Inference => "executor_inference",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{} error: {detail}", .kind.as_str())]
pub struct ExecutorError {
    pub kind: ExecutorErrorKind,
    pub detail: String,
}

impl ExecutorError {
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: ExecutorErrorKind::Timeout,
            detail: detail.into(),
        }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self {
            kind: ExecutorErrorKind::Transport,
            detail: detail.into(),
        }
    }

    pub fn inference(detail: impl Into<String>) -> Self {
        Self {
            kind: ExecutorErrorKind::Inference,
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ExecutorErrorKind::Transport
    }
}

/// Terminal failure of one inference request.
///
/// Cloneable so a whole-batch failure can be handed to every slot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Image decoding failed: {0}")]
    Decode(String),
    #[error("Incompatible image shape: {0}")]
    Shape(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unknown model variant `{0}`")]
    UnknownModel(String),
    #[error("Gateway overloaded: {0}")]
    Overloaded(String),
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Postprocessing failed: {0}")]
    Postprocess(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable label used in API error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Decode(_) => "decode_error",
            GatewayError::Shape(_) => "shape_error",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::UnknownModel(_) => "unknown_model",
            GatewayError::Overloaded(_) => "overloaded",
            GatewayError::RequestTimeout(_) => "request_timeout",
            GatewayError::Executor(e) => e.kind.as_str(),
            GatewayError::Postprocess(_) => "postprocess_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Caused by the client's input; never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Decode(_)
                | GatewayError::Shape(_)
                | GatewayError::InvalidRequest(_)
                | GatewayError::UnknownModel(_)
        )
    }

    pub fn executor_kind(&self) -> Option<ExecutorErrorKind> {
        match self {
            GatewayError::Executor(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(GatewayError::Decode("x".into()).kind(), "decode_error");
        assert_eq!(
            GatewayError::from(ExecutorError::timeout("slow")).kind(),
            "executor_timeout"
        );
        assert!(GatewayError::Shape("0x0".into()).is_client_error());
        assert_eq!(
            GatewayError::InvalidRequest("limit".into()).kind(),
            "invalid_request"
        );
        assert!(GatewayError::InvalidRequest("limit".into()).is_client_error());
        assert!(!GatewayError::Internal("bug".into()).is_client_error());
    }

    #[test]
    fn test_only_transport_errors_are_transient() {
        assert!(ExecutorError::transport("reset").is_transient());
        assert!(!ExecutorError::inference("bad shape").is_transient());
        assert!(!ExecutorError::timeout("slow").is_transient());
    }

    #[test]
    fn test_executor_error_display() {
        let err = GatewayError::from(ExecutorError::transport("connection reset"));
        assert_eq!(err.to_string(), "executor_transport error: connection reset");
    }
}
