use crate::blob::BlobError;
use teamflow::protocol::ErrorCode;
use teamflow_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("proof is required before this step can be completed")]
    ProofRequired,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Forbidden(_) => ErrorCode::Forbidden,
            EngineError::Validation(_) => ErrorCode::Validation,
            EngineError::ProofRequired => ErrorCode::ProofRequired,
            EngineError::Conflict(_) => ErrorCode::Conflict,
            EngineError::Unauthenticated => ErrorCode::Unauthenticated,
            EngineError::Storage(_) | EngineError::Blob(_) => ErrorCode::Internal,
        }
    }

    /// Convert to protocol error code and a message safe to send to clients.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            EngineError::Storage(_) => (ErrorCode::Internal, "internal storage error".to_string()),
            EngineError::Blob(_) => (ErrorCode::Internal, "internal blob store error".to_string()),
            other => (other.code(), other.to_string()),
        }
    }

    pub(crate) fn not_found(what: &str, id: &str) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_sanitized() {
        let err = EngineError::Storage(StoreError::Task("panicked at secrets.rs".into()));
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::Internal);
        assert!(!message.contains("secrets"));
    }

    #[test]
    fn domain_errors_keep_their_message() {
        let (code, message) = EngineError::not_found("session", "s1").to_error_code();
        assert_eq!(code, ErrorCode::NotFound);
        assert_eq!(message, "not found: session s1");
        assert_eq!(EngineError::ProofRequired.code().status(), 400);
    }
}
