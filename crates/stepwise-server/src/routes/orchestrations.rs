use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepwise_core::orchestration::{
    Advance, DefinitionDraft, IgnoreReason, Observed, OrchestrationDefinition,
    OrchestrationSession, StepCompletion, StepResult,
};
use stepwise_core::provider::ProviderSession;
use stepwise_core::types::{OrchestrationStatus, StepStatus};

use super::Tenant;
use crate::error::AppError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationView {
    pub orchestration_session_id: String,
    pub status: OrchestrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
    pub current_step_id: Option<String>,
    pub current_verification_session_id: Option<String>,
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrchestrationView {
    /// What an unknown (or purged, or foreign) session reads as.
    fn expired(id: String) -> Self {
        Self {
            orchestration_session_id: id,
            status: OrchestrationStatus::Expired,
            definition_id: None,
            current_step_id: None,
            current_verification_session_id: None,
            step_results: BTreeMap::new(),
            created_at: None,
            expires_at: None,
            completed_at: None,
        }
    }
}

impl From<OrchestrationSession> for OrchestrationView {
    fn from(s: OrchestrationSession) -> Self {
        Self {
            orchestration_session_id: s.id,
            status: s.status,
            definition_id: Some(s.definition_id),
            current_step_id: s.current_step_id,
            current_verification_session_id: s.current_verification_session_id,
            step_results: s.step_results,
            created_at: Some(s.created_at),
            expires_at: Some(s.expires_at),
            completed_at: s.completed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// POST /api/orchestrations: validate and register a definition.
pub async fn create_definition(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Json(draft): Json<DefinitionDraft>,
) -> Result<(StatusCode, Json<OrchestrationDefinition>), AppError> {
    let definition = app.engine.definitions().create(&tenant, draft)?;
    Ok((StatusCode::CREATED, Json(definition.as_ref().clone())))
}

/// GET /api/orchestrations: list the tenant's definitions.
pub async fn list_definitions(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
) -> Json<Vec<OrchestrationDefinition>> {
    let list = app
        .engine
        .definitions()
        .list(&tenant)
        .into_iter()
        .map(|d| d.as_ref().clone())
        .collect();
    Json(list)
}

/// GET /api/orchestrations/{id}
pub async fn get_definition(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationDefinition>, AppError> {
    let definition = app.engine.definitions().get(&tenant, &id)?;
    Ok(Json(definition.as_ref().clone()))
}

/// DELETE /api/orchestrations/{id}
pub async fn delete_definition(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    app.engine.definitions().delete(&tenant, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct StartBody {
    #[serde(default)]
    pub input: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub orchestration_session_id: String,
    pub current_step: String,
    pub verification: ProviderSession,
    pub expires_at: DateTime<Utc>,
}

/// POST /api/orchestrations/{definitionId}/sessions: start a run.
///
/// The body is optional; `{ "input": {...} }` binds run input.
pub async fn start_session(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path(definition_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    let body: StartBody = if body.iter().all(u8::is_ascii_whitespace) {
        StartBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid request body: {e}")))?
    };

    let engine = app.engine.clone();
    let started = tokio::task::spawn_blocking(move || {
        engine.start(&tenant, &definition_id, body.input)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            orchestration_session_id: started.session.id,
            current_step: started.step.id,
            verification: started.verification,
            expires_at: started.session.expires_at,
        }),
    ))
}

/// GET /api/orchestrations/sessions/{id}: current state; unknown ids read
/// as expired.
pub async fn get_session(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationView>, AppError> {
    let engine = app.engine.clone();
    let lookup_id = id.clone();
    let observed = tokio::task::spawn_blocking(move || engine.get(&lookup_id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    let Some(observed) = observed.filter(|o| o.session.tenant_id == tenant) else {
        return Ok(Json(OrchestrationView::expired(id)));
    };
    app.publish_observed(&observed);
    Ok(Json(observed.session.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteStepBody {
    pub verification_session_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteStepResponse {
    /// `advanced`, `finished`, `expired` or `ignored`.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<ProviderSession>,
    #[serde(flatten)]
    pub session: OrchestrationView,
}

fn ignore_reason(reason: IgnoreReason) -> &'static str {
    match reason {
        IgnoreReason::Missing => "missing",
        IgnoreReason::Terminal(_) => "terminal",
        IgnoreReason::NotCurrentStep => "not_current_step",
        IgnoreReason::StaleVerificationSession => "stale_verification_session",
    }
}

/// POST /api/orchestrations/sessions/{id}/steps/{stepId}/complete: explicit
/// step-completion event, for providers that report outcomes out of band.
pub async fn complete_step(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path((id, step_id)): Path<(String, String)>,
    Json(body): Json<CompleteStepBody>,
) -> Result<Json<CompleteStepResponse>, AppError> {
    let engine = app.engine.clone();
    let session_id = id.clone();
    let (observed, advance) = tokio::task::spawn_blocking(
        move || -> stepwise_core::Result<(Option<Observed>, Advance)> {
            let observed = engine
                .get(&session_id)?
                .filter(|o| o.session.tenant_id == tenant);
            let Some(observed) = observed else {
                return Ok((None, Advance::Ignored(IgnoreReason::Missing)));
            };
            if observed.just_expired {
                let session = observed.session.clone();
                return Ok((Some(observed), Advance::Expired { session }));
            }
            let advance = engine.advance(
                &session_id,
                StepCompletion {
                    step_id,
                    verification_session_id: body.verification_session_id,
                    status: body.status,
                    error: body.error,
                },
            )?;
            Ok((Some(observed), advance))
        },
    )
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    match &observed {
        // the lapse is announced by the Expired advance below
        Some(o) if o.just_expired => {}
        Some(o) => app.publish_observed(o),
        None => {}
    }
    app.publish_advance(&advance);
    Ok(Json(respond(&app, id, advance).await?))
}

async fn respond(
    app: &AppState,
    id: String,
    advance: Advance,
) -> Result<CompleteStepResponse, AppError> {
    let response = match advance {
        Advance::Advanced {
            session,
            verification,
            ..
        } => CompleteStepResponse {
            outcome: "advanced",
            reason: None,
            verification: Some(verification),
            session: session.into(),
        },
        Advance::Finished { session, .. } => CompleteStepResponse {
            outcome: "finished",
            reason: None,
            verification: None,
            session: session.into(),
        },
        Advance::Expired { session } => CompleteStepResponse {
            outcome: "expired",
            reason: None,
            verification: None,
            session: session.into(),
        },
        Advance::Ignored(reason) => {
            let engine = app.engine.clone();
            let lookup_id = id.clone();
            let current = tokio::task::spawn_blocking(move || engine.get(&lookup_id))
                .await
                .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
            if let Some(observed) = &current {
                app.publish_observed(observed);
            }
            let session = match (reason, current) {
                (IgnoreReason::Missing, _) | (_, None) => OrchestrationView::expired(id),
                (_, Some(observed)) => observed.session.into(),
            };
            CompleteStepResponse {
                outcome: "ignored",
                reason: Some(ignore_reason(reason)),
                verification: None,
                session,
            }
        }
    };
    Ok(response)
}
