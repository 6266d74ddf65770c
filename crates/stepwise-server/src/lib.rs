pub mod error;
pub mod routes;
pub mod state;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;
use stepwise_core::config::Config;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Orchestration definitions
        .route(
            "/api/orchestrations",
            get(routes::orchestrations::list_definitions)
                .post(routes::orchestrations::create_definition),
        )
        .route(
            "/api/orchestrations/{id}",
            get(routes::orchestrations::get_definition)
                .delete(routes::orchestrations::delete_definition),
        )
        // Orchestration sessions
        .route(
            "/api/orchestrations/{id}/sessions",
            post(routes::orchestrations::start_session),
        )
        .route(
            "/api/orchestrations/sessions/{id}",
            get(routes::orchestrations::get_session),
        )
        .route(
            "/api/orchestrations/sessions/{id}/steps/{step_id}/complete",
            post(routes::orchestrations::complete_step),
        )
        // Verification sessions
        .route("/api/sessions", post(routes::sessions::create_session))
        .route("/api/sessions/{id}", get(routes::sessions::get_session))
        .route(
            "/api/sessions/{id}/complete",
            post(routes::sessions::complete_session),
        )
        // Webhook subscriptions
        .route(
            "/api/webhooks",
            get(routes::webhooks::list_subscriptions)
                .post(routes::webhooks::create_subscription),
        )
        .route(
            "/api/webhooks/{id}",
            axum::routing::delete(routes::webhooks::delete_subscription),
        )
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the API server on `0.0.0.0:{port}`.
pub async fn serve(config: Config, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    serve_on(config, listener).await
}

/// Start the API server on a pre-bound listener.
///
/// The caller can read the actual port before starting (useful when
/// `port = 0` and the OS picks a free port).
pub async fn serve_on(config: Config, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(AppState::new(config)?);

    tracing::info!("stepwise listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
