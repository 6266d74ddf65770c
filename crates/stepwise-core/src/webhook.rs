//! Webhook events, payload signing and tenant subscriptions.
//!
//! Delivery itself is asynchronous and lives in the server; everything here
//! is synchronous and side-effect free apart from the registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, StepwiseError};
use crate::orchestration::session::{META_ORCHESTRATION_SESSION, META_ORCHESTRATION_STEP};
use crate::orchestration::{OrchestrationSession, StepResult};
use crate::session::{SessionResult, VerificationSession};
use crate::types::{generate_id, OrchestrationStatus, SessionStatus};

type HmacSha256 = Hmac<Sha256>;

/// Prefix for subscription identifiers.
pub const SUBSCRIPTION_ID_PREFIX: &str = "wh";

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const EVENT_HEADER: &str = "x-webhook-event";
pub const DELIVERY_HEADER: &str = "x-webhook-delivery";

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "verification.verified")]
    VerificationVerified,
    #[serde(rename = "verification.failed")]
    VerificationFailed,
    #[serde(rename = "verification.expired")]
    VerificationExpired,
    #[serde(rename = "orchestration.step_completed")]
    OrchestrationStepCompleted,
    #[serde(rename = "orchestration.completed")]
    OrchestrationCompleted,
    #[serde(rename = "orchestration.failed")]
    OrchestrationFailed,
    #[serde(rename = "orchestration.expired")]
    OrchestrationExpired,
}

impl EventType {
    pub fn all() -> &'static [EventType] {
        &[
            EventType::VerificationVerified,
            EventType::VerificationFailed,
            EventType::VerificationExpired,
            EventType::OrchestrationStepCompleted,
            EventType::OrchestrationCompleted,
            EventType::OrchestrationFailed,
            EventType::OrchestrationExpired,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::VerificationVerified => "verification.verified",
            EventType::VerificationFailed => "verification.failed",
            EventType::VerificationExpired => "verification.expired",
            EventType::OrchestrationStepCompleted => "orchestration.step_completed",
            EventType::OrchestrationCompleted => "orchestration.completed",
            EventType::OrchestrationFailed => "orchestration.failed",
            EventType::OrchestrationExpired => "orchestration.expired",
        }
    }

    /// Event announcing a verification session reaching `status`.
    pub fn for_session(status: SessionStatus) -> Option<Self> {
        match status {
            SessionStatus::Pending => None,
            SessionStatus::Verified => Some(EventType::VerificationVerified),
            SessionStatus::Failed => Some(EventType::VerificationFailed),
            SessionStatus::Expired => Some(EventType::VerificationExpired),
        }
    }

    /// Event announcing an orchestration session reaching `status`.
    pub fn for_orchestration(status: OrchestrationStatus) -> Option<Self> {
        match status {
            OrchestrationStatus::InProgress => None,
            OrchestrationStatus::Completed => Some(EventType::OrchestrationCompleted),
            OrchestrationStatus::Failed => Some(EventType::OrchestrationFailed),
            OrchestrationStatus::Expired => Some(EventType::OrchestrationExpired),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = StepwiseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EventType::all()
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| StepwiseError::InvalidEventType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// `data` member of a webhook payload. `session_id` is the id receivers
/// deduplicate on: the verification session for `verification.*` events,
/// the orchestration session for `orchestration.*` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub session_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_results: Option<BTreeMap<String, StepResult>>,
}

impl EventData {
    fn bare(session_id: &str, status: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: status.to_string(),
            result: None,
            metadata: BTreeMap::new(),
            error: None,
            definition_id: None,
            step_id: None,
            verification_session_id: None,
            step_results: None,
        }
    }

    pub fn verification(session: &VerificationSession) -> Self {
        Self {
            result: session.result.clone(),
            metadata: session.metadata.clone(),
            error: session.error.clone(),
            ..Self::bare(&session.id, session.status.as_str())
        }
    }

    /// Data for `orchestration.step_completed`. `status` is the step's own
    /// outcome.
    pub fn step_completed(session: &OrchestrationSession, step_id: &str) -> Self {
        let step = session.step_results.get(step_id);
        Self {
            definition_id: Some(session.definition_id.clone()),
            step_id: Some(step_id.to_string()),
            verification_session_id: step.map(|r| r.verification_session_id.clone()),
            error: step.and_then(|r| r.error.clone()),
            ..Self::bare(
                &session.id,
                step.map(|r| r.status.as_str()).unwrap_or("unknown"),
            )
        }
    }

    /// Data for `verification.expired` when a step's verification session
    /// lapsed without a callback and its orchestration recorded the expiry.
    /// `None` if the step has no result.
    pub fn lapsed_step_session(session: &OrchestrationSession, step_id: &str) -> Option<Self> {
        let step = session.step_results.get(step_id)?;
        let metadata = BTreeMap::from([
            (META_ORCHESTRATION_SESSION.to_string(), session.id.clone()),
            (META_ORCHESTRATION_STEP.to_string(), step_id.to_string()),
        ]);
        Some(Self {
            metadata,
            error: step.error.clone(),
            ..Self::bare(&step.verification_session_id, SessionStatus::Expired.as_str())
        })
    }

    pub fn orchestration(session: &OrchestrationSession) -> Self {
        Self {
            definition_id: Some(session.definition_id.clone()),
            step_results: Some(session.step_results.clone()),
            ..Self::bare(&session.id, session.status.as_str())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl WebhookEvent {
    pub fn new(event: EventType, data: EventData) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Lowercase hex HMAC-SHA256 of `data` under `secret`.
pub fn sign(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// The string that is signed for a delivery: `{timestamp}.{body}`.
pub fn signed_content(timestamp: i64, body: &str) -> String {
    format!("{timestamp}.{body}")
}

/// Signature header value for `body` sent at `timestamp` (unix seconds).
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    sign(secret.as_bytes(), signed_content(timestamp, body).as_bytes())
}

/// Receiver-side check of a delivery signature, in constant time.
pub fn verify_signature(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(signed_content(timestamp, body).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

/// Caller-supplied subscription, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDraft {
    pub url: String,
    /// Generated when absent.
    #[serde(default)]
    pub secret: Option<String>,
    pub events: Vec<EventType>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: String,
    pub tenant_id: String,
    pub url: String,
    pub secret: String,
    pub events: Vec<EventType>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn wants(&self, event: EventType) -> bool {
        self.enabled && self.events.contains(&event)
    }

    /// Copy with the secret blanked, for listings.
    pub fn redacted(&self) -> Self {
        Self {
            secret: String::new(),
            ..self.clone()
        }
    }
}

fn check_draft(draft: &SubscriptionDraft) -> Result<()> {
    if !(draft.url.starts_with("http://") || draft.url.starts_with("https://")) {
        return Err(StepwiseError::InvalidSubscription(format!(
            "url must be http(s): '{}'",
            draft.url
        )));
    }
    if draft.events.is_empty() {
        return Err(StepwiseError::InvalidSubscription(
            "at least one event type is required".to_string(),
        ));
    }
    if draft.secret.as_deref() == Some("") {
        return Err(StepwiseError::InvalidSubscription(
            "secret must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, WebhookSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, tenant_id: &str, draft: SubscriptionDraft) -> Result<WebhookSubscription> {
        check_draft(&draft)?;
        let mut events = Vec::with_capacity(draft.events.len());
        for e in draft.events {
            if !events.contains(&e) {
                events.push(e);
            }
        }
        let sub = WebhookSubscription {
            id: generate_id(SUBSCRIPTION_ID_PREFIX),
            tenant_id: tenant_id.to_string(),
            url: draft.url,
            secret: draft.secret.unwrap_or_else(|| generate_id("whsec")),
            events,
            enabled: draft.enabled,
            created_at: Utc::now(),
        };
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sub.id.clone(), sub.clone());
        tracing::info!(subscription_id = %sub.id, tenant = %tenant_id, url = %sub.url, "webhook subscription created");
        Ok(sub)
    }

    /// Subscriptions of `tenant_id`, oldest first.
    pub fn list(&self, tenant_id: &str) -> Vec<WebhookSubscription> {
        let mut list: Vec<_> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        let mut map = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match map.get(id) {
            Some(s) if s.tenant_id == tenant_id => {
                map.remove(id);
                Ok(())
            }
            _ => Err(StepwiseError::SubscriptionNotFound(id.to_string())),
        }
    }

    /// Enabled subscriptions of `tenant_id` that want `event`.
    pub fn matching(&self, tenant_id: &str, event: EventType) -> Vec<WebhookSubscription> {
        self.list(tenant_id)
            .into_iter()
            .filter(|s| s.wants(event))
            .collect()
    }
}
