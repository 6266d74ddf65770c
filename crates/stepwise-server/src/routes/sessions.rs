use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use stepwise_core::orchestration::session::{META_ORCHESTRATION_SESSION, META_ORCHESTRATION_STEP};
use stepwise_core::orchestration::Advance;
use stepwise_core::session::{SessionResult, VerificationSession};
use stepwise_core::types::{ResponseMode, SessionStatus};

use super::Tenant;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub template_ref: String,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// POST /api/sessions: open a standalone verification session.
pub async fn create_session(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<VerificationSession>), AppError> {
    if body.template_ref.trim().is_empty() {
        return Err(AppError::bad_request("templateRef is required"));
    }
    if let Some(key) = [META_ORCHESTRATION_SESSION, META_ORCHESTRATION_STEP]
        .into_iter()
        .find(|k| body.metadata.contains_key(*k))
    {
        return Err(AppError::bad_request(format!(
            "metadata key '{key}' is reserved"
        )));
    }

    let sessions = app.sessions.clone();
    let session = tokio::task::spawn_blocking(move || {
        sessions.create_session(&tenant, &body.template_ref, body.response_mode, body.metadata)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SessionView {
    Found(VerificationSession),
    Gone { id: String, status: SessionStatus },
}

impl SessionView {
    fn gone(id: String) -> Self {
        SessionView::Gone {
            id,
            status: SessionStatus::Expired,
        }
    }
}

/// GET /api/sessions/{id}: unknown ids read as expired.
pub async fn get_session(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    let sessions = app.sessions.clone();
    let lookup_id = id.clone();
    let session = tokio::task::spawn_blocking(move || sessions.get_session(&lookup_id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(match session.filter(|s| s.tenant_id == tenant) {
        Some(s) => SessionView::Found(s),
        None => SessionView::gone(id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteSessionBody {
    pub status: SessionStatus,
    #[serde(default)]
    pub result: Option<SessionResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSessionResponse {
    pub session: SessionView,
    /// Set when the session belonged to an orchestration step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestration: Option<OrchestrationOutcome>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationOutcome {
    pub orchestration_session_id: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<stepwise_core::types::OrchestrationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Why the orchestration could not be advanced; redeliver to retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestrationOutcome {
    fn from_advance(orchestration_id: &str, advance: &Advance) -> Self {
        let outcome = match advance {
            Advance::Advanced { .. } => "advanced",
            Advance::Finished { .. } => "finished",
            Advance::Expired { .. } => "expired",
            Advance::Ignored(_) => "ignored",
        };
        let session = advance.session();
        Self {
            orchestration_session_id: orchestration_id.to_string(),
            outcome,
            status: session.map(|s| s.status),
            current_step_id: session.and_then(|s| s.current_step_id.clone()),
            error: None,
        }
    }

    fn retry(orchestration_id: &str, error: String) -> Self {
        Self {
            orchestration_session_id: orchestration_id.to_string(),
            outcome: "retry",
            status: None,
            current_step_id: None,
            error: Some(error),
        }
    }
}

/// POST /api/sessions/{id}/complete: record a verification outcome.
///
/// This is the local provider's callback. A session opened for an
/// orchestration step also advances its orchestration. Completing an
/// already-terminal session changes nothing, but its orchestration is
/// offered the outcome again, so a redelivery recovers a failed advance.
pub async fn complete_session(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    Json(body): Json<CompleteSessionBody>,
) -> Result<Json<CompleteSessionResponse>, AppError> {
    if !body.status.is_terminal() {
        return Err(AppError::bad_request(
            "status must be one of verified, failed, expired",
        ));
    }

    let sessions = app.sessions.clone();
    let engine = app.engine.clone();
    let lookup_id = id.clone();
    let outcome = tokio::task::spawn_blocking(move || -> stepwise_core::Result<_> {
        let Some((session, changed)) =
            sessions.complete_session(&tenant, &lookup_id, body.status, body.result, body.error)?
        else {
            return Ok(None);
        };
        let advance = engine.advance_from_session(&session);
        Ok(Some((session, changed, advance)))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    let Some((session, changed, advance)) = outcome else {
        return Ok(Json(CompleteSessionResponse {
            session: SessionView::gone(id),
            orchestration: None,
        }));
    };

    if changed {
        app.publish_verification(&session);
    }
    let orchestration_id = session
        .metadata
        .get(META_ORCHESTRATION_SESSION)
        .cloned()
        .unwrap_or_default();
    let orchestration = match advance {
        Ok(advance) => advance.map(|a| {
            app.publish_advance(&a);
            OrchestrationOutcome::from_advance(&orchestration_id, &a)
        }),
        Err(e) => {
            tracing::warn!(
                session_id = %session.id,
                orchestration_session_id = %orchestration_id,
                error = %e,
                "orchestration advance failed; awaiting redelivery"
            );
            Some(OrchestrationOutcome::retry(&orchestration_id, e.to_string()))
        }
    };

    Ok(Json(CompleteSessionResponse {
        session: SessionView::Found(session),
        orchestration,
    }))
}
