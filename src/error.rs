use std::time::Duration;
use thiserror::Error;

use crate::cua::ResponseStatus;

/// Failure surfaced by the remote model service, before the resilience
/// policy decides what to do with it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request failed: {message}")]
    Other { status: Option<u16>, message: String },
    #[error("unexpected response shape: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unsupported tool '{0}'")]
    UnsupportedTool(String),
    #[error("unsupported response output type '{0}'")]
    UnimplementedProtocolItem(String),
    #[error("rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("remote service error: {message}")]
    RemoteService { status: Option<u16>, message: String },
    #[error("response finished with status '{0}', expected 'completed'")]
    CompletionStatus(ResponseStatus),
    #[error("pointer action before any screenshot established a scale ratio")]
    ScaleNotInitialized,
    #[error("computer error: {0}")]
    Computer(String),
    #[error("tool '{name}' failed: {message}")]
    Tool { name: String, message: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task cancelled")]
    Cancelled,
}

impl From<ModelError> for AgentError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::RateLimited {
                message,
                retry_after,
            } => AgentError::RateLimitExceeded {
                message,
                retry_after,
            },
            ModelError::Server { status, message } => AgentError::RemoteService {
                status: Some(status),
                message,
            },
            ModelError::Other { status, message } => AgentError::RemoteService { status, message },
            ModelError::Protocol(message) => AgentError::RemoteService {
                status: None,
                message: format!("malformed response: {message}"),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
