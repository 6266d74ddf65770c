//! Verification session records and the session manager.
//!
//! A verification session is one runtime execution of a single step's
//! verification request. Records live in the [`EphemeralStore`] under
//! `session:{id}` with a fixed TTL; a missing record is indistinguishable
//! from an expired one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};
use crate::orchestration::locks::KeyedLocks;
use crate::store::{session_key, EphemeralStore};
use crate::types::{generate_id, ResponseMode, SessionStatus};

/// Prefix for verification session identifiers.
pub const SESSION_ID_PREFIX: &str = "vs";

/// Default lifetime of a verification session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Format-specific type identifier of a presented credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// SD-JWT family: verifiable credential type string.
    Vct(String),
    /// mdoc family: document type string.
    DocType(String),
}

/// One presented credential in `raw_credentials` mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisclosedCredential {
    pub format: String,
    pub credential_type: CredentialType,
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// Outcome payload of a verified session. The variant always matches the
/// session's [`ResponseMode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "data", rename_all = "snake_case")]
pub enum SessionResult {
    Answers(BTreeMap<String, String>),
    RawCredentials(Vec<DisclosedCredential>),
}

impl SessionResult {
    pub fn mode(&self) -> ResponseMode {
        match self {
            SessionResult::Answers(_) => ResponseMode::Answers,
            SessionResult::RawCredentials(_) => ResponseMode::RawCredentials,
        }
    }
}

// ---------------------------------------------------------------------------
// VerificationSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSession {
    pub id: String,
    pub tenant_id: String,
    pub template_ref: String,
    pub response_mode: ResponseMode,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationSession {
    /// Whether the session's deadline has passed at `now`.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Record a terminal outcome on this record (not persisted).
    ///
    /// A result is only kept for `Verified`, and must match the session's
    /// response mode.
    pub fn complete(
        &mut self,
        status: SessionStatus,
        result: Option<SessionResult>,
        error: Option<String>,
    ) -> Result<()> {
        if let Some(r) = &result {
            if r.mode() != self.response_mode {
                return Err(StepwiseError::ResponseModeMismatch {
                    expected: self.response_mode,
                });
            }
        }
        self.status = status;
        self.result = if status == SessionStatus::Verified {
            result
        } else {
            None
        };
        self.error = error;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Creates, reads and updates verification sessions in the ephemeral store.
pub struct SessionManager {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
    locks: KeyedLocks,
}

impl SessionManager {
    pub fn new(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            locks: KeyedLocks::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create and persist a new `Pending` session.
    pub fn create_session(
        &self,
        tenant_id: &str,
        template_ref: &str,
        response_mode: ResponseMode,
        metadata: BTreeMap<String, String>,
    ) -> Result<VerificationSession> {
        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(self.ttl)
            .map_err(|e| StepwiseError::Store(e.to_string()))?;
        let session = VerificationSession {
            id: generate_id(SESSION_ID_PREFIX),
            tenant_id: tenant_id.to_string(),
            template_ref: template_ref.to_string(),
            response_mode,
            status: SessionStatus::Pending,
            result: None,
            error: None,
            metadata,
            created_at: now,
            expires_at: now + lifetime,
        };
        let data = serde_json::to_vec(&session)?;
        self.store.set(&session_key(&session.id), &data, self.ttl)?;
        tracing::debug!(session_id = %session.id, template = %template_ref, "verification session created");
        Ok(session)
    }

    /// Load a session. `None` means the record is gone, which callers treat
    /// as expired.
    pub fn get_session(&self, id: &str) -> Result<Option<VerificationSession>> {
        let Some(data) = self.store.get(&session_key(id))? else {
            return Ok(None);
        };
        let mut session: VerificationSession = serde_json::from_slice(&data)?;
        if !session.status.is_terminal() && session.is_lapsed(Utc::now()) {
            session.status = SessionStatus::Expired;
        }
        Ok(Some(session))
    }

    /// Record a terminal outcome for `tenant_id`'s session `id`, serialized
    /// per id.
    ///
    /// `None` if the session is gone or belongs to another tenant. The flag
    /// is false when the session was already terminal; the stored record is
    /// returned unchanged in that case.
    pub fn complete_session(
        &self,
        tenant_id: &str,
        id: &str,
        status: SessionStatus,
        result: Option<SessionResult>,
        error: Option<String>,
    ) -> Result<Option<(VerificationSession, bool)>> {
        self.locks.with(id, || {
            let Some(mut session) = self
                .get_session(id)?
                .filter(|s| s.tenant_id == tenant_id)
            else {
                return Ok(None);
            };
            if session.status.is_terminal() {
                return Ok(Some((session, false)));
            }
            session.complete(status, result, error)?;
            let session = self.update_session(session)?;
            tracing::debug!(session_id = %id, status = %session.status, "verification session completed");
            Ok(Some((session, true)))
        })
    }

    /// Persist a mutated session under its existing key, keeping whatever
    /// TTL remains. A session whose TTL already lapsed is not written back
    /// and is returned marked `Expired`.
    pub fn update_session(&self, mut session: VerificationSession) -> Result<VerificationSession> {
        let key = session_key(&session.id);
        let Some(remaining) = self.store.ttl(&key)? else {
            session.status = SessionStatus::Expired;
            session.result = None;
            return Ok(session);
        };
        let data = serde_json::to_vec(&session)?;
        self.store.set(&key, &data, remaining)?;
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
