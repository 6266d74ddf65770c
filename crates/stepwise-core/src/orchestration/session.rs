//! Orchestration session runtime state.
//!
//! The whole mutable state of one orchestration run lives in a single
//! [`OrchestrationSession`] value, stored under `orchestration:{id}`, so that
//! every update is all-or-nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::VerificationSession;
use crate::types::{OrchestrationStatus, StepStatus};

/// Prefix for orchestration session identifiers.
pub const ORCHESTRATION_ID_PREFIX: &str = "os";

/// Metadata key linking a verification session to its orchestration session.
pub const META_ORCHESTRATION_SESSION: &str = "orchestration_session_id";

/// Metadata key linking a verification session to its orchestration step.
pub const META_ORCHESTRATION_STEP: &str = "orchestration_step_id";

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome of one step. Written exactly once per step id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub verification_session_id: String,
    pub status: StepStatus,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn new(
        verification_session_id: impl Into<String>,
        status: StepStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            verification_session_id: verification_session_id.into(),
            status,
            success: status.is_success(),
            completed_at: Utc::now(),
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// StepCompletion
// ---------------------------------------------------------------------------

/// External event: "step `step_id` finished with `status`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCompletion {
    pub step_id: String,
    pub verification_session_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepCompletion {
    /// Build the completion event carried by a terminal verification session
    /// that was opened for an orchestration step. Returns the orchestration
    /// session id alongside the event.
    ///
    /// `None` for standalone sessions and for sessions still pending.
    pub fn from_session(session: &VerificationSession) -> Option<(String, StepCompletion)> {
        let orchestration_id = session.metadata.get(META_ORCHESTRATION_SESSION)?;
        let step_id = session.metadata.get(META_ORCHESTRATION_STEP)?;
        let status = StepStatus::from_session(session.status)?;
        Some((
            orchestration_id.clone(),
            StepCompletion {
                step_id: step_id.clone(),
                verification_session_id: session.id.clone(),
                status,
                error: session.error.clone(),
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// OrchestrationSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSession {
    pub id: String,
    pub definition_id: String,
    pub tenant_id: String,
    pub status: OrchestrationStatus,
    pub current_step_id: Option<String>,
    pub current_verification_session_id: Option<String>,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub input: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every persisted mutation.
    #[serde(default)]
    pub version: u64,
}

impl OrchestrationSession {
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Flip an in-progress session whose deadline passed to `Expired`.
    /// Returns whether the status changed.
    pub fn expire_if_lapsed(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OrchestrationStatus::InProgress || !self.is_lapsed(now) {
            return false;
        }
        self.status = OrchestrationStatus::Expired;
        self.completed_at = Some(now);
        true
    }

    /// Move to a terminal status, clearing the current step pointers.
    pub(crate) fn finish(&mut self, status: OrchestrationStatus) {
        self.status = status;
        self.current_step_id = None;
        self.current_verification_session_id = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn all_succeeded(&self) -> bool {
        self.step_results.values().all(|r| r.success)
    }
}
