use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use stepwise_core::webhook::{SubscriptionDraft, WebhookSubscription};

use super::Tenant;
use crate::error::AppError;
use crate::state::AppState;

/// POST /api/webhooks: subscribe an endpoint. The response is the only
/// place the secret is shown.
pub async fn create_subscription(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Json(draft): Json<SubscriptionDraft>,
) -> Result<(StatusCode, Json<WebhookSubscription>), AppError> {
    let sub = app.subscriptions.create(&tenant, draft)?;
    Ok((StatusCode::CREATED, Json(sub)))
}

/// GET /api/webhooks: list subscriptions, secrets blanked.
pub async fn list_subscriptions(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
) -> Json<Vec<WebhookSubscription>> {
    Json(
        app.subscriptions
            .list(&tenant)
            .iter()
            .map(WebhookSubscription::redacted)
            .collect(),
    )
}

/// DELETE /api/webhooks/{id}
pub async fn delete_subscription(
    State(app): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    app.subscriptions.delete(&tenant, &id)?;
    Ok(StatusCode::NO_CONTENT)
}
