use std::path::PathBuf;

use thiserror::Error;

/// Core error type for the research loop.
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },
    #[error("planner unavailable: {0}")]
    PlannerUnavailable(String),
    #[error("malformed planner output: {0}")]
    MalformedPlannerOutput(String),
    #[error("rate limit wait for {cost} tokens exceeded deadline after {waited_ms}ms")]
    RateLimitTimeout { cost: u64, waited_ms: u64 },
    #[error("document store exhausted: {0}")]
    StoreExhausted(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ResearchError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn service(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the loop may degrade and keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidConfiguration(_)
                | Self::MissingSecret(_)
                | Self::ConfigIo { .. }
                | Self::StoreExhausted(_)
        )
    }
}
