use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StepwiseError;

/// Tenant used when a caller does not name one.
pub const DEFAULT_TENANT: &str = "default";

/// Length of the random part of every generated identifier.
pub const ID_RANDOM_LEN: usize = 32;

/// Generate an opaque identifier: `{prefix}_` followed by
/// [`ID_RANDOM_LEN`] alphanumeric characters.
pub fn generate_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}_{suffix}")
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a single verification session.
///
/// `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Verified,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Verified => "verified",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Pending)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "verified" => Ok(SessionStatus::Verified),
            "failed" => Ok(SessionStatus::Failed),
            "expired" => Ok(SessionStatus::Expired),
            _ => Err(StepwiseError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Terminal outcome of one orchestration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Verified,
    Failed,
    Expired,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Verified => "verified",
            StepStatus::Failed => "failed",
            StepStatus::Expired => "expired",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, StepStatus::Verified)
    }

    /// Map a terminal session status onto a step outcome. `Pending` has no
    /// step counterpart.
    pub fn from_session(status: SessionStatus) -> Option<Self> {
        match status {
            SessionStatus::Pending => None,
            SessionStatus::Verified => Some(StepStatus::Verified),
            SessionStatus::Failed => Some(StepStatus::Failed),
            SessionStatus::Expired => Some(StepStatus::Expired),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(StepStatus::Verified),
            "failed" => Ok(StepStatus::Failed),
            "expired" => Ok(StepStatus::Expired),
            _ => Err(StepwiseError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestrationStatus
// ---------------------------------------------------------------------------

/// Lifecycle of an orchestration session.
///
/// Transitions: `InProgress → Completed | Failed | Expired`. All three
/// targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl OrchestrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestrationStatus::InProgress => "in_progress",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrchestrationStatus::InProgress)
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ResponseMode
// ---------------------------------------------------------------------------

/// What a completed verification session yields: aliased answer fields or
/// full disclosed-credential records. Fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    #[default]
    Answers,
    RawCredentials,
}

impl ResponseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseMode::Answers => "answers",
            ResponseMode::RawCredentials => "raw_credentials",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResponseMode {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "answers" => Ok(ResponseMode::Answers),
            "raw_credentials" | "raw-credentials" => Ok(ResponseMode::RawCredentials),
            _ => Err(StepwiseError::InvalidResponseMode(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_prefix_and_fixed_length() {
        let id = generate_id("vs");
        assert!(id.starts_with("vs_"));
        assert_eq!(id.len(), 3 + ID_RANDOM_LEN);
        assert!(id[3..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(generate_id("vs"), generate_id("vs"));
    }

    #[test]
    fn session_status_parses_and_displays() {
        for s in ["pending", "verified", "failed", "expired"] {
            let parsed: SessionStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("done".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(!OrchestrationStatus::InProgress.is_terminal());
        assert!(OrchestrationStatus::Failed.is_terminal());
    }

    #[test]
    fn step_status_success_is_verified_only() {
        assert!(StepStatus::Verified.is_success());
        assert!(!StepStatus::Failed.is_success());
        assert!(!StepStatus::Expired.is_success());
        assert_eq!(StepStatus::from_session(SessionStatus::Pending), None);
    }

    #[test]
    fn response_mode_accepts_hyphenated_alias() {
        assert_eq!(
            "raw-credentials".parse::<ResponseMode>().unwrap(),
            ResponseMode::RawCredentials
        );
        assert_eq!(
            serde_json::to_string(&ResponseMode::RawCredentials).unwrap(),
            "\"raw_credentials\""
        );
    }
}
