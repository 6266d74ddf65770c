pub mod orchestrations;
pub mod sessions;
pub mod webhooks;

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use stepwise_core::types::DEFAULT_TENANT;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Calling tenant, from the `x-tenant-id` header. Requests without one act
/// as the default tenant.
#[derive(Debug, Clone)]
pub struct Tenant(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_TENANT);
        Ok(Tenant(tenant.to_string()))
    }
}
