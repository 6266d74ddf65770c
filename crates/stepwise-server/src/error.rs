use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use stepwise_core::error::StepwiseError;

/// Request-shape problem detected in a handler rather than in core.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct BadRequest(String);

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequest(msg.into()).into())
    }
}

fn status_for(e: &StepwiseError) -> StatusCode {
    match e {
        StepwiseError::DefinitionNotFound(_) | StepwiseError::SubscriptionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        StepwiseError::InvalidDefinition(_)
        | StepwiseError::InvalidSubscription(_)
        | StepwiseError::InvalidStatus(_)
        | StepwiseError::InvalidResponseMode(_)
        | StepwiseError::InvalidEventType(_) => StatusCode::BAD_REQUEST,
        StepwiseError::ResponseModeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        StepwiseError::Provider(_) => StatusCode::BAD_GATEWAY,
        StepwiseError::Store(_)
        | StepwiseError::ConfigNotFound(_)
        | StepwiseError::Io(_)
        | StepwiseError::Yaml(_)
        | StepwiseError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<BadRequest>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<StepwiseError>() {
            status_for(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
