//! Orchestration engine: starts runs and advances them one completion event
//! at a time.
//!
//! Every mutation of an orchestration session happens under the per-id lock
//! in [`KeyedLocks`], as a read-modify-write of the single JSON record in the
//! ephemeral store. Nothing here blocks on the network except provider
//! calls: opening the next step's verification session, and asking for the
//! current one's status when a run is read.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::definition::{
    find_first_step, find_next_eligible_step, validate_steps, CompletionTarget,
    OrchestrationStep, ValidationError,
};
use super::locks::KeyedLocks;
use super::registry::DefinitionRegistry;
use super::session::{
    OrchestrationSession, StepCompletion, StepResult, META_ORCHESTRATION_SESSION,
    META_ORCHESTRATION_STEP, ORCHESTRATION_ID_PREFIX,
};
use crate::error::{Result, StepwiseError};
use crate::provider::{ProviderSession, VerificationProvider};
use crate::session::VerificationSession;
use crate::store::{orchestration_key, EphemeralStore};
use crate::types::{generate_id, OrchestrationStatus, StepStatus};

/// Default lifetime of an orchestration run.
pub const DEFAULT_ORCHESTRATION_TTL: Duration = Duration::from_secs(1800);

/// Default time a record is kept after it stops being live.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How long a run may stay in progress.
    pub ttl: Duration,
    /// How long the record outlives its deadline (or its terminal status).
    pub retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_ORCHESTRATION_TTL,
            retention: DEFAULT_RETENTION,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StartedOrchestration {
    pub session: OrchestrationSession,
    pub step: OrchestrationStep,
    pub verification: ProviderSession,
}

/// A session as seen by a reader. `just_expired` is set only for the read
/// that flipped the status to `Expired`.
#[derive(Debug, Clone)]
pub struct Observed {
    pub session: OrchestrationSession,
    pub just_expired: bool,
    /// Set when the read found the current step's verification session
    /// already terminal at the provider with no callback applied, and
    /// recorded that outcome. `session` is the result.
    pub reconciled: Option<Advance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No record under the id (never existed, or purged).
    Missing,
    Terminal(OrchestrationStatus),
    NotCurrentStep,
    StaleVerificationSession,
}

#[derive(Debug, Clone)]
pub enum Advance {
    /// The step result was recorded and the next step opened.
    Advanced {
        session: OrchestrationSession,
        completed_step: String,
        next_step: OrchestrationStep,
        verification: ProviderSession,
    },
    /// The step result was recorded and the run reached `Completed` or
    /// `Failed`.
    Finished {
        session: OrchestrationSession,
        completed_step: String,
    },
    /// The run's deadline had passed; the completion was not recorded.
    Expired { session: OrchestrationSession },
    /// Nothing changed.
    Ignored(IgnoreReason),
}

impl Advance {
    pub fn session(&self) -> Option<&OrchestrationSession> {
        match self {
            Advance::Advanced { session, .. }
            | Advance::Finished { session, .. }
            | Advance::Expired { session } => Some(session),
            Advance::Ignored(_) => None,
        }
    }

    /// The step whose result this advance recorded.
    pub fn completed_step(&self) -> Option<&str> {
        match self {
            Advance::Advanced { completed_step, .. } | Advance::Finished { completed_step, .. } => {
                Some(completed_step)
            }
            Advance::Expired { .. } | Advance::Ignored(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    store: Arc<dyn EphemeralStore>,
    provider: Arc<dyn VerificationProvider>,
    definitions: Arc<DefinitionRegistry>,
    locks: KeyedLocks,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        provider: Arc<dyn VerificationProvider>,
        definitions: Arc<DefinitionRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            provider,
            definitions,
            locks: KeyedLocks::new(),
            settings,
        }
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    /// Start a run of `definition_id`: open the entry step's verification
    /// session and persist the new orchestration session.
    pub fn start(
        &self,
        tenant_id: &str,
        definition_id: &str,
        input: BTreeMap<String, serde_json::Value>,
    ) -> Result<StartedOrchestration> {
        let definition = self.definitions.get(tenant_id, definition_id)?;
        validate_steps(&definition.steps)?;
        let first = find_first_step(&definition).ok_or(ValidationError::NoEntryStep)?;

        let id = generate_id(ORCHESTRATION_ID_PREFIX);
        let verification = self.open_step(&id, tenant_id, first)?;

        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(self.settings.ttl)
            .map_err(|e| StepwiseError::Store(e.to_string()))?;
        let mut session = OrchestrationSession {
            id,
            definition_id: definition.id.clone(),
            tenant_id: tenant_id.to_string(),
            status: OrchestrationStatus::InProgress,
            current_step_id: Some(first.id.clone()),
            current_verification_session_id: Some(verification.session_id.clone()),
            step_results: BTreeMap::new(),
            input,
            created_at: now,
            expires_at: now + lifetime,
            completed_at: None,
            version: 0,
        };
        self.save(&mut session)?;

        tracing::info!(
            orchestration_id = %session.id,
            definition_id = %definition.id,
            step = %first.id,
            "orchestration started"
        );
        Ok(StartedOrchestration {
            session,
            step: first.clone(),
            verification,
        })
    }

    /// Read a session, flipping it to `Expired` if its deadline passed.
    /// `None` means the record is gone; callers treat that as expired.
    ///
    /// A live run also checks its current verification session with the
    /// provider and applies a terminal outcome nobody reported, so a step
    /// whose session lapsed does not hold the run until its own deadline.
    pub fn get(&self, id: &str) -> Result<Option<Observed>> {
        self.locks.with(id, || {
            let Some(mut session) = self.load(id)? else {
                return Ok(None);
            };
            if session.expire_if_lapsed(Utc::now()) {
                self.save(&mut session)?;
                tracing::info!(orchestration_id = %id, "orchestration expired");
                return Ok(Some(Observed {
                    session,
                    just_expired: true,
                    reconciled: None,
                }));
            }
            let reconciled = self.reconcile_locked(&session);
            if let Some(updated) = reconciled.as_ref().and_then(Advance::session) {
                session = updated.clone();
            }
            Ok(Some(Observed {
                session,
                just_expired: false,
                reconciled,
            }))
        })
    }

    /// Apply one step-completion event.
    ///
    /// A completion for anything other than the current step and its
    /// current verification session is ignored, as is any completion for a
    /// terminal run. If opening the next step's verification session fails
    /// the error is returned and nothing is persisted, so the same
    /// completion can be replayed. A run whose definition was deleted fails
    /// on its next completion.
    pub fn advance(&self, id: &str, completion: StepCompletion) -> Result<Advance> {
        self.locks.with(id, || self.advance_locked(id, completion))
    }

    /// Advance the orchestration a terminal verification session belongs
    /// to, if any.
    pub fn advance_from_session(
        &self,
        session: &VerificationSession,
    ) -> Result<Option<Advance>> {
        match StepCompletion::from_session(session) {
            Some((orchestration_id, completion)) => {
                self.advance(&orchestration_id, completion).map(Some)
            }
            None => Ok(None),
        }
    }

    /// The `on_complete` target of the definition a session runs, if the
    /// definition still exists and declares one.
    pub fn completion_target(&self, session: &OrchestrationSession) -> Option<CompletionTarget> {
        self.definitions
            .get(&session.tenant_id, &session.definition_id)
            .ok()
            .and_then(|d| d.on_complete.clone())
    }

    fn advance_locked(&self, id: &str, completion: StepCompletion) -> Result<Advance> {
        let Some(mut session) = self.load(id)? else {
            return Ok(Advance::Ignored(IgnoreReason::Missing));
        };

        if session.expire_if_lapsed(Utc::now()) {
            self.save(&mut session)?;
            tracing::info!(orchestration_id = %id, "orchestration expired");
            return Ok(Advance::Expired { session });
        }
        if session.status.is_terminal() {
            return Ok(Advance::Ignored(IgnoreReason::Terminal(session.status)));
        }
        if session.current_step_id.as_deref() != Some(completion.step_id.as_str()) {
            tracing::debug!(
                orchestration_id = %id,
                step = %completion.step_id,
                "completion for non-current step ignored"
            );
            return Ok(Advance::Ignored(IgnoreReason::NotCurrentStep));
        }
        if session.current_verification_session_id.as_deref()
            != Some(completion.verification_session_id.as_str())
        {
            return Ok(Advance::Ignored(IgnoreReason::StaleVerificationSession));
        }

        self.apply_locked(session, completion)
    }

    /// Pull the provider's view of the current verification session and, if
    /// it is terminal, apply it as a completion. Provider or store trouble
    /// is logged and leaves the run as it was.
    fn reconcile_locked(&self, session: &OrchestrationSession) -> Option<Advance> {
        if session.status != OrchestrationStatus::InProgress {
            return None;
        }
        let step_id = session.current_step_id.clone()?;
        let verification_session_id = session.current_verification_session_id.clone()?;

        let status = match self.provider.get_session_status(&verification_session_id) {
            Ok(s) => StepStatus::from_session(s.status)?,
            Err(e) => {
                tracing::warn!(
                    orchestration_id = %session.id,
                    verification_session_id = %verification_session_id,
                    error = %e,
                    "provider status check failed"
                );
                return None;
            }
        };
        let error = (status == StepStatus::Expired)
            .then(|| "verification session expired".to_string());
        let completion = StepCompletion {
            step_id,
            verification_session_id,
            status,
            error,
        };

        match self.apply_locked(session.clone(), completion) {
            Ok(advance) => {
                tracing::info!(
                    orchestration_id = %session.id,
                    status = %status,
                    "unreported step outcome applied"
                );
                Some(advance)
            }
            Err(e) => {
                tracing::warn!(
                    orchestration_id = %session.id,
                    error = %e,
                    "could not apply unreported step outcome"
                );
                None
            }
        }
    }

    /// Record the current step's result and move on. The caller has already
    /// checked that `completion` targets the current step of a live run.
    fn apply_locked(
        &self,
        mut session: OrchestrationSession,
        completion: StepCompletion,
    ) -> Result<Advance> {
        let id = session.id.clone();
        let completed_step = completion.step_id;
        session.step_results.insert(
            completed_step.clone(),
            StepResult::new(
                completion.verification_session_id,
                completion.status,
                completion.error,
            ),
        );

        let definition = match self
            .definitions
            .get(&session.tenant_id, &session.definition_id)
        {
            Ok(d) => d,
            Err(StepwiseError::DefinitionNotFound(_)) => {
                session.finish(OrchestrationStatus::Failed);
                self.save(&mut session)?;
                tracing::warn!(
                    orchestration_id = %id,
                    definition_id = %session.definition_id,
                    "definition removed mid-run; orchestration failed"
                );
                return Ok(Advance::Finished {
                    session,
                    completed_step,
                });
            }
            Err(e) => return Err(e),
        };

        if let Some(next) = find_next_eligible_step(&definition, &session.step_results) {
            let verification = self.open_step(&id, &session.tenant_id, next)?;
            session.current_step_id = Some(next.id.clone());
            session.current_verification_session_id = Some(verification.session_id.clone());
            self.save(&mut session)?;
            tracing::info!(
                orchestration_id = %id,
                completed = %completed_step,
                next = %next.id,
                "orchestration advanced"
            );
            return Ok(Advance::Advanced {
                session,
                completed_step,
                next_step: next.clone(),
                verification,
            });
        }

        let status = if session.all_succeeded() {
            OrchestrationStatus::Completed
        } else {
            OrchestrationStatus::Failed
        };
        session.finish(status);
        self.save(&mut session)?;
        tracing::info!(orchestration_id = %id, status = %status, "orchestration finished");
        Ok(Advance::Finished {
            session,
            completed_step,
        })
    }

    fn open_step(
        &self,
        orchestration_id: &str,
        tenant_id: &str,
        step: &OrchestrationStep,
    ) -> Result<ProviderSession> {
        let mut metadata = step.config.clone();
        metadata.insert(
            META_ORCHESTRATION_SESSION.to_string(),
            orchestration_id.to_string(),
        );
        metadata.insert(META_ORCHESTRATION_STEP.to_string(), step.id.clone());
        self.provider
            .create_verification_session(tenant_id, &step.template, step.response_mode, metadata)
    }

    fn load(&self, id: &str) -> Result<Option<OrchestrationSession>> {
        match self.store.get(&orchestration_key(id))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Bump the version and write the whole record. Live runs are kept until
    /// their deadline plus retention, terminal ones for the retention window.
    fn save(&self, session: &mut OrchestrationSession) -> Result<()> {
        session.version += 1;
        let ttl = if session.status.is_terminal() {
            self.settings.retention
        } else {
            let left = (session.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            left + self.settings.retention
        };
        let data = serde_json::to_vec(session)?;
        self.store.set(&orchestration_key(&session.id), &data, ttl)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::definition::DefinitionDraft;
    use crate::provider::{LocalProvider, ProviderStatus};
    use crate::session::{SessionManager, DEFAULT_SESSION_TTL};
    use crate::store::MemoryStore;
    use crate::types::{ResponseMode, SessionStatus, StepStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        sessions: Arc<SessionManager>,
        engine: Arc<Engine>,
    }

    fn harness_with(settings: EngineSettings) -> Harness {
        harness_with_session_ttl(settings, DEFAULT_SESSION_TTL)
    }

    fn harness_with_session_ttl(settings: EngineSettings, session_ttl: Duration) -> Harness {
        let store: Arc<dyn EphemeralStore> = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(store.clone(), session_ttl));
        let provider = Arc::new(LocalProvider::new(sessions.clone()));
        let engine = Arc::new(Engine::new(
            store,
            provider,
            Arc::new(DefinitionRegistry::new()),
            settings,
        ));
        Harness { sessions, engine }
    }

    fn harness() -> Harness {
        harness_with(EngineSettings::default())
    }

    fn register(engine: &Engine, steps: Vec<OrchestrationStep>) -> String {
        engine
            .definitions()
            .create(
                "t1",
                DefinitionDraft {
                    name: "kyc".into(),
                    steps,
                    on_complete: None,
                },
            )
            .unwrap()
            .id
            .clone()
    }

    fn complete_current(engine: &Engine, id: &str, status: StepStatus) -> Advance {
        let current = engine.get(id).unwrap().unwrap().session;
        engine
            .advance(
                id,
                StepCompletion {
                    step_id: current.current_step_id.unwrap(),
                    verification_session_id: current.current_verification_session_id.unwrap(),
                    status,
                    error: None,
                },
            )
            .unwrap()
    }

    fn next_step_id(advance: &Advance) -> &str {
        match advance {
            Advance::Advanced { next_step, .. } => &next_step.id,
            other => panic!("expected Advanced, got {other:?}"),
        }
    }

    #[test]
    fn linear_chain_completes() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
                OrchestrationStep::new("c", "tpl-c").after(["b"]),
            ],
        );
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        assert_eq!(started.step.id, "a");
        assert_eq!(started.session.version, 1);
        let id = started.session.id.clone();

        assert_eq!(next_step_id(&complete_current(&h.engine, &id, StepStatus::Verified)), "b");
        assert_eq!(next_step_id(&complete_current(&h.engine, &id, StepStatus::Verified)), "c");
        match complete_current(&h.engine, &id, StepStatus::Verified) {
            Advance::Finished { session, completed_step } => {
                assert_eq!(completed_step, "c");
                assert_eq!(session.status, OrchestrationStatus::Completed);
                assert!(session.completed_at.is_some());
                assert!(session.current_step_id.is_none());
                assert_eq!(session.step_results.len(), 3);
                assert_eq!(session.version, 4);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn step_sessions_carry_orchestration_metadata() {
        let h = harness();
        let mut step = OrchestrationStep::new("a", "tpl-a");
        step.response_mode = ResponseMode::RawCredentials;
        step.config.insert("purpose".into(), "onboarding".into());
        let def = register(&h.engine, vec![step]);
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();

        let vs = h
            .sessions
            .get_session(&started.verification.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(vs.template_ref, "tpl-a");
        assert_eq!(vs.response_mode, ResponseMode::RawCredentials);
        assert_eq!(vs.metadata["purpose"], "onboarding");
        assert_eq!(vs.metadata[META_ORCHESTRATION_SESSION], started.session.id);
        assert_eq!(vs.metadata[META_ORCHESTRATION_STEP], "a");
    }

    #[test]
    fn diamond_runs_in_declared_order() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
                OrchestrationStep::new("c", "tpl-c").after(["a"]),
                OrchestrationStep::new("d", "tpl-d").after(["b", "c"]),
            ],
        );
        let id = h.engine.start("t1", &def, BTreeMap::new()).unwrap().session.id;

        assert_eq!(next_step_id(&complete_current(&h.engine, &id, StepStatus::Verified)), "b");
        // d stays blocked until c has a result
        assert_eq!(next_step_id(&complete_current(&h.engine, &id, StepStatus::Verified)), "c");
        assert_eq!(next_step_id(&complete_current(&h.engine, &id, StepStatus::Verified)), "d");
        let done = complete_current(&h.engine, &id, StepStatus::Verified);
        assert_eq!(
            done.session().unwrap().status,
            OrchestrationStatus::Completed
        );
    }

    #[test]
    fn failure_blocks_dependents() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let sessions_before = started.verification.session_id.clone();

        match complete_current(&h.engine, &started.session.id, StepStatus::Failed) {
            Advance::Finished { session, .. } => {
                assert_eq!(session.status, OrchestrationStatus::Failed);
                assert!(!session.step_results["a"].success);
                assert!(!session.step_results.contains_key("b"));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert!(h.sessions.get_session(&sessions_before).unwrap().is_some());
    }

    #[test]
    fn independent_branch_still_runs_after_failure() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
                OrchestrationStep::new("x", "tpl-x"),
            ],
        );
        let id = h.engine.start("t1", &def, BTreeMap::new()).unwrap().session.id;

        assert_eq!(next_step_id(&complete_current(&h.engine, &id, StepStatus::Expired)), "x");
        let done = complete_current(&h.engine, &id, StepStatus::Verified);
        let session = done.session().unwrap();
        assert_eq!(session.status, OrchestrationStatus::Failed);
        assert!(session.step_results["x"].success);
        assert!(!session.step_results.contains_key("b"));
    }

    #[test]
    fn duplicate_and_late_completions_are_ignored() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let id = started.session.id.clone();
        let first = StepCompletion {
            step_id: "a".into(),
            verification_session_id: started.verification.session_id.clone(),
            status: StepStatus::Verified,
            error: None,
        };

        assert!(matches!(
            h.engine.advance(&id, first.clone()).unwrap(),
            Advance::Advanced { .. }
        ));
        let version = h.engine.get(&id).unwrap().unwrap().session.version;

        assert!(matches!(
            h.engine.advance(&id, first.clone()).unwrap(),
            Advance::Ignored(IgnoreReason::NotCurrentStep)
        ));

        let wrong_session = StepCompletion {
            step_id: "b".into(),
            verification_session_id: started.verification.session_id.clone(),
            ..first.clone()
        };
        assert!(matches!(
            h.engine.advance(&id, wrong_session).unwrap(),
            Advance::Ignored(IgnoreReason::StaleVerificationSession)
        ));
        assert_eq!(h.engine.get(&id).unwrap().unwrap().session.version, version);

        complete_current(&h.engine, &id, StepStatus::Verified);
        let after_finish = h.engine.advance(&id, first).unwrap();
        assert!(matches!(
            after_finish,
            Advance::Ignored(IgnoreReason::Terminal(OrchestrationStatus::Completed))
        ));
    }

    #[test]
    fn unknown_session_is_missing() {
        let h = harness();
        assert!(h.engine.get("os_nope").unwrap().is_none());
        let advance = h
            .engine
            .advance(
                "os_nope",
                StepCompletion {
                    step_id: "a".into(),
                    verification_session_id: "vs_x".into(),
                    status: StepStatus::Verified,
                    error: None,
                },
            )
            .unwrap();
        assert!(matches!(advance, Advance::Ignored(IgnoreReason::Missing)));
    }

    #[test]
    fn lapsed_run_expires_lazily_once() {
        let h = harness_with(EngineSettings {
            ttl: Duration::ZERO,
            retention: Duration::from_secs(60),
        });
        let def = register(&h.engine, vec![OrchestrationStep::new("a", "tpl-a")]);
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let id = started.session.id.clone();

        let first = h.engine.get(&id).unwrap().unwrap();
        assert!(first.just_expired);
        assert_eq!(first.session.status, OrchestrationStatus::Expired);
        assert!(first.session.completed_at.is_some());

        let second = h.engine.get(&id).unwrap().unwrap();
        assert!(!second.just_expired);
        assert_eq!(second.session.status, OrchestrationStatus::Expired);

        let late = h
            .engine
            .advance(
                &id,
                StepCompletion {
                    step_id: "a".into(),
                    verification_session_id: started.verification.session_id,
                    status: StepStatus::Verified,
                    error: None,
                },
            )
            .unwrap();
        assert!(matches!(
            late,
            Advance::Ignored(IgnoreReason::Terminal(OrchestrationStatus::Expired))
        ));
    }

    #[test]
    fn advance_on_lapsed_run_reports_expiry() {
        let h = harness_with(EngineSettings {
            ttl: Duration::ZERO,
            retention: Duration::from_secs(60),
        });
        let def = register(&h.engine, vec![OrchestrationStep::new("a", "tpl-a")]);
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let advance = h
            .engine
            .advance(
                &started.session.id,
                StepCompletion {
                    step_id: "a".into(),
                    verification_session_id: started.verification.session_id,
                    status: StepStatus::Verified,
                    error: None,
                },
            )
            .unwrap();
        match advance {
            Advance::Expired { session } => {
                assert_eq!(session.status, OrchestrationStatus::Expired);
                assert!(session.step_results.is_empty());
            }
            other => panic!("expected Expired, got {other:?}"),
        }
    }

    #[test]
    fn advance_from_completed_verification_session() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let mut vs = h
            .sessions
            .get_session(&started.verification.session_id)
            .unwrap()
            .unwrap();
        vs.complete(SessionStatus::Verified, None, None).unwrap();
        let vs = h.sessions.update_session(vs).unwrap();

        let advance = h.engine.advance_from_session(&vs).unwrap().unwrap();
        assert_eq!(next_step_id(&advance), "b");
    }

    #[test]
    fn concurrent_duplicates_advance_once() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let completion = StepCompletion {
            step_id: "a".into(),
            verification_session_id: started.verification.session_id.clone(),
            status: StepStatus::Verified,
            error: None,
        };

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = h.engine.clone();
                let id = started.session.id.clone();
                let completion = completion.clone();
                std::thread::spawn(move || engine.advance(&id, completion).unwrap())
            })
            .collect();
        let advanced = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| matches!(a, Advance::Advanced { .. }))
            .count();
        assert_eq!(advanced, 1);
    }

    struct FlakyProvider {
        inner: LocalProvider,
        calls: AtomicUsize,
        fail_from: usize,
    }

    impl VerificationProvider for FlakyProvider {
        fn create_verification_session(
            &self,
            tenant_id: &str,
            template_ref: &str,
            response_mode: ResponseMode,
            metadata: BTreeMap<String, String>,
        ) -> Result<ProviderSession> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_from {
                return Err(StepwiseError::Provider("provider unavailable".into()));
            }
            self.inner
                .create_verification_session(tenant_id, template_ref, response_mode, metadata)
        }

        fn get_session_status(&self, session_id: &str) -> Result<ProviderStatus> {
            self.inner.get_session_status(session_id)
        }
    }

    #[test]
    fn provider_failure_leaves_session_untouched() {
        let store: Arc<dyn EphemeralStore> = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionManager::new(store.clone(), DEFAULT_SESSION_TTL));
        let provider = Arc::new(FlakyProvider {
            inner: LocalProvider::new(sessions),
            calls: AtomicUsize::new(0),
            fail_from: 1,
        });
        let engine = Engine::new(
            store,
            provider,
            Arc::new(DefinitionRegistry::new()),
            EngineSettings::default(),
        );
        let def = register(
            &engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let started = engine.start("t1", &def, BTreeMap::new()).unwrap();
        let completion = StepCompletion {
            step_id: "a".into(),
            verification_session_id: started.verification.session_id.clone(),
            status: StepStatus::Verified,
            error: None,
        };

        let err = engine.advance(&started.session.id, completion).unwrap_err();
        assert!(matches!(err, StepwiseError::Provider(_)));

        let stored = engine.get(&started.session.id).unwrap().unwrap().session;
        assert_eq!(stored, started.session);
    }

    #[test]
    fn start_requires_known_definition() {
        let h = harness();
        let err = h.engine.start("t1", "od_missing", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StepwiseError::DefinitionNotFound(_)));
    }

    #[test]
    fn lapsed_step_session_is_recorded_on_read() {
        let h = harness_with_session_ttl(EngineSettings::default(), Duration::from_millis(20));
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let id = started.session.id.clone();
        std::thread::sleep(Duration::from_millis(50));

        let observed = h.engine.get(&id).unwrap().unwrap();
        assert!(!observed.just_expired);
        match observed.reconciled {
            Some(Advance::Finished { ref session, ref completed_step }) => {
                assert_eq!(completed_step, "a");
                assert_eq!(session.status, OrchestrationStatus::Failed);
            }
            ref other => panic!("expected Finished, got {other:?}"),
        }
        assert_eq!(observed.session.status, OrchestrationStatus::Failed);
        let a = &observed.session.step_results["a"];
        assert_eq!(a.status, StepStatus::Expired);
        assert_eq!(a.verification_session_id, started.verification.session_id);
        assert!(!observed.session.step_results.contains_key("b"));

        let again = h.engine.get(&id).unwrap().unwrap();
        assert!(again.reconciled.is_none());
        assert_eq!(again.session.version, observed.session.version);
    }

    #[test]
    fn unreported_verified_session_is_applied_on_read() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        h.sessions
            .complete_session(
                "t1",
                &started.verification.session_id,
                SessionStatus::Verified,
                None,
                None,
            )
            .unwrap()
            .unwrap();

        let observed = h.engine.get(&started.session.id).unwrap().unwrap();
        assert_eq!(next_step_id(observed.reconciled.as_ref().unwrap()), "b");
        assert_eq!(observed.session.current_step_id.as_deref(), Some("b"));
        assert!(observed.session.step_results["a"].success);

        // the late callback for the same session is now a no-op
        let vs = h
            .sessions
            .get_session(&started.verification.session_id)
            .unwrap()
            .unwrap();
        assert!(matches!(
            h.engine.advance_from_session(&vs).unwrap(),
            Some(Advance::Ignored(IgnoreReason::NotCurrentStep))
        ));
    }

    #[test]
    fn pending_step_session_leaves_run_alone() {
        let h = harness();
        let def = register(&h.engine, vec![OrchestrationStep::new("a", "tpl-a")]);
        let started = h.engine.start("t1", &def, BTreeMap::new()).unwrap();
        let observed = h.engine.get(&started.session.id).unwrap().unwrap();
        assert!(observed.reconciled.is_none());
        assert_eq!(observed.session, started.session);
    }

    #[test]
    fn deleted_definition_fails_run_on_next_completion() {
        let h = harness();
        let def = register(
            &h.engine,
            vec![
                OrchestrationStep::new("a", "tpl-a"),
                OrchestrationStep::new("b", "tpl-b").after(["a"]),
            ],
        );
        let id = h.engine.start("t1", &def, BTreeMap::new()).unwrap().session.id;
        h.engine.definitions().delete("t1", &def).unwrap();

        match complete_current(&h.engine, &id, StepStatus::Verified) {
            Advance::Finished { session, completed_step } => {
                assert_eq!(completed_step, "a");
                assert_eq!(session.status, OrchestrationStatus::Failed);
                assert!(session.step_results["a"].success);
                assert!(session.current_step_id.is_none());
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }
}
