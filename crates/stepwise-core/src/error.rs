use thiserror::Error;

use crate::orchestration::ValidationError;
use crate::types::ResponseMode;

#[derive(Debug, Error)]
pub enum StepwiseError {
    #[error("invalid orchestration definition: {0}")]
    InvalidDefinition(#[from] ValidationError),

    #[error("orchestration definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("webhook subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("invalid webhook subscription: {0}")]
    InvalidSubscription(String),

    #[error("result does not match session response mode '{expected}'")]
    ResponseModeMismatch { expected: ResponseMode },

    #[error("invalid status '{0}'")]
    InvalidStatus(String),

    #[error("invalid response mode '{0}'")]
    InvalidResponseMode(String),

    #[error("invalid event type '{0}'")]
    InvalidEventType(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("verification provider error: {0}")]
    Provider(String),

    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StepwiseError>;
