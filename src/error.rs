//! Error types shared across the pipeline.
//!
//! Library code returns these `thiserror` enums; the binary wraps them in
//! `anyhow` for reporting.

use std::path::PathBuf;

/// Failure reported by a [`LanguageModel`](crate::llm::LanguageModel) backend.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limited by language model service: {0}")]
    RateLimited(String),

    #[error("authentication rejected by language model service: {0}")]
    Authentication(String),

    #[error("connection to language model service failed: {0}")]
    Connection(String),

    #[error("language model service returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response from language model service: {0}")]
    InvalidResponse(String),
}

/// Fatal credential failure. Stops the run; nothing else is surfaced this way.
#[derive(Debug, Clone, thiserror::Error)]
#[error("authentication failed: {0}")]
pub struct AuthenticationFailed(pub String);

/// Errors that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("regulation source has no clauses: {0}")]
    NoClauses(PathBuf),

    #[error("failed to read regulation source {path:?}: {message}")]
    Regulation { path: PathBuf, message: String },

    #[error("failed to checkpoint run state to {path:?}: {source}")]
    Checkpoint {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to persist vector index: {0}")]
    Index(String),

    #[error(transparent)]
    Authentication(#[from] AuthenticationFailed),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::from(AuthenticationFailed("401 invalid key".into()));
        assert_eq!(err.to_string(), "authentication failed: 401 invalid key");

        let err = GatewayError::Api {
            status: 400,
            body: "bad request".into(),
        };
        assert_eq!(
            err.to_string(),
            "language model service returned 400: bad request"
        );
    }
}
