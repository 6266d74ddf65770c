//! Verification provider seam.
//!
//! The wallet-facing presentation protocol is an external black box. The
//! engine only needs two things from it: open a session for a template, and
//! report a session's status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};
use crate::session::{SessionManager, SessionResult};
use crate::types::{ResponseMode, SessionStatus};

/// A session opened by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSession {
    pub session_id: String,
    /// Opaque request handed to the holder's wallet.
    pub request_payload: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub status: SessionStatus,
    /// Only populated when `status` is `Verified`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
}

impl ProviderStatus {
    pub fn expired() -> Self {
        Self {
            status: SessionStatus::Expired,
            result: None,
        }
    }

    fn normalized(mut self) -> Self {
        if self.status != SessionStatus::Verified {
            self.result = None;
        }
        self
    }
}

pub trait VerificationProvider: Send + Sync {
    fn create_verification_session(
        &self,
        tenant_id: &str,
        template_ref: &str,
        response_mode: ResponseMode,
        metadata: BTreeMap<String, String>,
    ) -> Result<ProviderSession>;

    fn get_session_status(&self, session_id: &str) -> Result<ProviderStatus>;
}

// ---------------------------------------------------------------------------
// LocalProvider
// ---------------------------------------------------------------------------

/// Provider backed by the local [`SessionManager`]. Outcomes are reported
/// back through the session-completion API.
pub struct LocalProvider {
    sessions: Arc<SessionManager>,
}

impl LocalProvider {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

impl VerificationProvider for LocalProvider {
    fn create_verification_session(
        &self,
        tenant_id: &str,
        template_ref: &str,
        response_mode: ResponseMode,
        metadata: BTreeMap<String, String>,
    ) -> Result<ProviderSession> {
        let session =
            self.sessions
                .create_session(tenant_id, template_ref, response_mode, metadata)?;
        let request_payload = serde_json::json!({
            "sessionId": session.id,
            "template": session.template_ref,
            "responseMode": session.response_mode,
            "expiresAt": session.expires_at,
        });
        Ok(ProviderSession {
            session_id: session.id,
            request_payload,
            expires_at: session.expires_at,
        })
    }

    fn get_session_status(&self, session_id: &str) -> Result<ProviderStatus> {
        Ok(match self.sessions.get_session(session_id)? {
            Some(s) => ProviderStatus {
                status: s.status,
                result: s.result,
            }
            .normalized(),
            None => ProviderStatus::expired(),
        })
    }
}

// ---------------------------------------------------------------------------
// HttpProvider
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    tenant_id: &'a str,
    template_ref: &'a str,
    response_mode: ResponseMode,
    metadata: &'a BTreeMap<String, String>,
}

/// Provider reached over HTTP.
///
/// - `POST {base_url}/sessions` opens a session
/// - `GET {base_url}/sessions/{id}` reports its status; 404 reads as expired
pub struct HttpProvider {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn provider_err(e: impl std::fmt::Display) -> StepwiseError {
    StepwiseError::Provider(e.to_string())
}

impl VerificationProvider for HttpProvider {
    fn create_verification_session(
        &self,
        tenant_id: &str,
        template_ref: &str,
        response_mode: ResponseMode,
        metadata: BTreeMap<String, String>,
    ) -> Result<ProviderSession> {
        let url = format!("{}/sessions", self.base_url);
        let body = CreateSessionRequest {
            tenant_id,
            template_ref,
            response_mode,
            metadata: &metadata,
        };
        let resp = self
            .agent
            .post(&url)
            .send_json(&body)
            .map_err(provider_err)?;
        resp.into_json::<ProviderSession>().map_err(provider_err)
    }

    fn get_session_status(&self, session_id: &str) -> Result<ProviderStatus> {
        let url = format!("{}/sessions/{session_id}", self.base_url);
        match self.agent.get(&url).call() {
            Ok(resp) => Ok(resp
                .into_json::<ProviderStatus>()
                .map_err(provider_err)?
                .normalized()),
            Err(ureq::Error::Status(404, _)) => Ok(ProviderStatus::expired()),
            Err(e) => Err(provider_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DEFAULT_SESSION_TTL;
    use crate::store::MemoryStore;

    fn local() -> (Arc<SessionManager>, LocalProvider) {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemoryStore::new()),
            DEFAULT_SESSION_TTL,
        ));
        (sessions.clone(), LocalProvider::new(sessions))
    }

    #[test]
    fn local_provider_creates_managed_session() {
        let (sessions, provider) = local();
        let opened = provider
            .create_verification_session("t1", "tpl-pid", ResponseMode::Answers, BTreeMap::new())
            .unwrap();
        assert_eq!(opened.request_payload["template"], "tpl-pid");
        assert_eq!(opened.request_payload["sessionId"], opened.session_id.as_str());

        let stored = sessions.get_session(&opened.session_id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Pending);
        assert_eq!(stored.expires_at, opened.expires_at);
    }

    #[test]
    fn local_provider_reports_unknown_as_expired() {
        let (_sessions, provider) = local();
        let status = provider.get_session_status("vs_unknown").unwrap();
        assert_eq!(status, ProviderStatus::expired());
    }

    #[test]
    fn http_provider_opens_session() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/sessions")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "tenantId": "t1",
                "templateRef": "tpl-pid",
                "responseMode": "raw_credentials",
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"sessionId":"ext_1","requestPayload":{"uri":"openid4vp://x"},"expiresAt":"2030-01-01T00:00:00Z"}"#,
            )
            .create();

        let provider = HttpProvider::new(server.url(), Duration::from_secs(5));
        let opened = provider
            .create_verification_session(
                "t1",
                "tpl-pid",
                ResponseMode::RawCredentials,
                BTreeMap::new(),
            )
            .unwrap();

        mock.assert();
        assert_eq!(opened.session_id, "ext_1");
        assert_eq!(opened.request_payload["uri"], "openid4vp://x");
    }

    #[test]
    fn http_provider_not_found_is_expired() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/sessions/ext_gone").with_status(404).create();

        let provider = HttpProvider::new(server.url(), Duration::from_secs(5));
        let status = provider.get_session_status("ext_gone").unwrap();
        assert_eq!(status.status, SessionStatus::Expired);
    }

    #[test]
    fn http_provider_drops_result_unless_verified() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/sessions/ext_2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"failed","result":{"mode":"answers","data":{"a":"b"}}}"#)
            .create();

        let provider = HttpProvider::new(server.url(), Duration::from_secs(5));
        let status = provider.get_session_status("ext_2").unwrap();
        assert_eq!(status.status, SessionStatus::Failed);
        assert!(status.result.is_none());
    }

    #[test]
    fn http_provider_surfaces_server_errors() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/sessions").with_status(500).create();

        let provider = HttpProvider::new(server.url(), Duration::from_secs(5));
        let err = provider
            .create_verification_session("t1", "tpl", ResponseMode::Answers, BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Provider(_)));
    }
}
