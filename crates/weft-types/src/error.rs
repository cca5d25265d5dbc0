//! Uniform error type used across the control-plane surface.
//!
//! Every facade operation returns [`WeftError`]; the RPC layer maps each
//! variant to one wire status code via [`WeftError::code`]. Background loops
//! never propagate these errors upward: they log and backoff, reset, or
//! continue.

use serde::{Deserialize, Serialize};

/// Wire status codes of the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or malformed request field.
    InvalidArgument,
    /// Unknown agent, session, schedule, question, or artifact.
    NotFound,
    /// Required subsystem not configured, YAML-sourced schedule mutation.
    FailedPrecondition,
    /// Communication plane not configured.
    Unavailable,
    /// Spawn limit or other quota exceeded.
    ResourceExhausted,
    /// Name collision where overwrite was not requested.
    AlreadyExists,
    /// Reply or schedule timeout.
    DeadlineExceeded,
    /// The caller cancelled.
    Canceled,
    /// Unexpected store or provider failure.
    Internal,
}

/// Domain error carrying one of the uniform status codes.
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    /// Missing or malformed request field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Unknown agent, session, schedule, question, or artifact.
    #[error("not found: {0}")]
    NotFound(String),
    /// Required subsystem not configured, or a YAML-sourced schedule was
    /// mutated via RPC.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// A communication plane is not configured on this server.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Spawn limit or other quota exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Name collision where overwrite was not requested.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A reply or schedule deadline passed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// The caller cancelled the operation.
    #[error("canceled: {0}")]
    Canceled(String),
    /// Unexpected store or provider failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl WeftError {
    /// The wire status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::Canceled(_) => ErrorCode::Canceled,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// NotFound for an unknown agent, listing the ids that do exist.
    pub fn unknown_agent(id: &str, available: &[String]) -> Self {
        Self::NotFound(format!("agent {id:?} not found; available agents: {}", available.join(", ")))
    }
}

impl From<anyhow::Error> for WeftError {
    fn from(err: anyhow::Error) -> Self {
        // Unknown errors map to Internal per the error-code table.
        match err.downcast::<WeftError>() {
            Ok(weft) => weft,
            Err(other) => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(WeftError::InvalidArgument("x".into()).code(), ErrorCode::InvalidArgument);
        assert_eq!(WeftError::DeadlineExceeded("x".into()).code(), ErrorCode::DeadlineExceeded);
        assert_eq!(WeftError::Internal("x".into()).code(), ErrorCode::Internal);
    }

    #[test]
    fn test_unknown_agent_lists_available() {
        let err = WeftError::unknown_agent("ghost", &["demo".into(), "writer".into()]);
        let text = err.to_string();
        assert!(text.contains("ghost"));
        assert!(text.contains("demo, writer"));
    }

    #[test]
    fn test_anyhow_roundtrip() {
        let err: anyhow::Error = WeftError::NotFound("session s1".into()).into();
        let back: WeftError = err.into();
        assert_eq!(back.code(), ErrorCode::NotFound);

        let opaque: WeftError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(opaque.code(), ErrorCode::Internal);
    }
}
