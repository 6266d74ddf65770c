use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stepwise_core::config::{Config, ProviderConfig, StoreBackend};
use stepwise_core::orchestration::{
    Advance, DefinitionRegistry, Engine, Observed, OrchestrationSession,
};
use stepwise_core::provider::{HttpProvider, LocalProvider, VerificationProvider};
use stepwise_core::session::{SessionManager, VerificationSession};
use stepwise_core::types::StepStatus;
use stepwise_core::store::{EphemeralStore, MemoryStore, RedbStore};
use stepwise_core::webhook::{EventData, EventType, SubscriptionRegistry, WebhookEvent};

use crate::webhook::{RetryPolicy, WebhookDispatcher};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn EphemeralStore>,
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<Engine>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub webhooks: WebhookDispatcher,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn EphemeralStore> = match &config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redb { path } => Arc::new(
                RedbStore::open(path)
                    .with_context(|| format!("opening store at {}", path.display()))?,
            ),
        };

        let sessions = Arc::new(SessionManager::new(store.clone(), config.sessions.ttl()));
        let provider: Arc<dyn VerificationProvider> = match &config.provider {
            ProviderConfig::Local => Arc::new(LocalProvider::new(sessions.clone())),
            ProviderConfig::Http {
                base_url,
                timeout_secs,
            } => Arc::new(HttpProvider::new(
                base_url.clone(),
                Duration::from_secs(*timeout_secs),
            )),
        };
        let engine = Arc::new(Engine::new(
            store.clone(),
            provider,
            Arc::new(DefinitionRegistry::new()),
            config.orchestrations.engine_settings(),
        ));

        let subscriptions = Arc::new(SubscriptionRegistry::new());
        for seed in &config.webhooks.subscriptions {
            subscriptions
                .create(&seed.tenant, seed.subscription.clone())
                .with_context(|| format!("seeding webhook subscription {}", seed.subscription.url))?;
        }
        let webhooks = WebhookDispatcher::new(
            subscriptions.clone(),
            RetryPolicy::from_config(&config.webhooks),
            Duration::from_secs(config.webhooks.timeout_secs),
        )?;

        let state = Self {
            config: Arc::new(config),
            store,
            sessions,
            engine,
            subscriptions,
            webhooks,
        };

        // Guard: only spawn if inside a Tokio runtime (skipped in sync unit tests).
        if tokio::runtime::Handle::try_current().is_ok() {
            let store = state.store.clone();
            let every = Duration::from_secs(state.config.store.purge_interval_secs.max(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    let store = store.clone();
                    match tokio::task::spawn_blocking(move || store.purge_expired()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(n)) => tracing::debug!(removed = n, "purged lapsed records"),
                        Ok(Err(e)) => tracing::warn!(error = %e, "store purge failed"),
                        Err(e) => tracing::warn!(error = %e, "store purge task failed"),
                    }
                }
            });
        }

        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Event publication
    // -----------------------------------------------------------------------

    /// Announce a verification session that reached a terminal status.
    pub fn publish_verification(&self, session: &VerificationSession) {
        let Some(kind) = EventType::for_session(session.status) else {
            return;
        };
        let event = WebhookEvent::new(kind, EventData::verification(session));
        self.webhooks.dispatch_event(&session.tenant_id, &event);
    }

    /// Announce whatever an engine advance changed.
    pub fn publish_advance(&self, advance: &Advance) {
        match advance {
            Advance::Advanced {
                session,
                completed_step,
                ..
            } => self.publish_step(session, completed_step),
            Advance::Finished {
                session,
                completed_step,
            } => {
                self.publish_step(session, completed_step);
                self.publish_orchestration(session);
            }
            Advance::Expired { session } => self.publish_orchestration(session),
            Advance::Ignored(_) => {}
        }
    }

    /// Announce what a read changed: a run that lapsed, or a step outcome
    /// picked up from the provider. A lapsed step session never produced a
    /// callback, so its `verification.expired` goes out here.
    pub fn publish_observed(&self, observed: &Observed) {
        if observed.just_expired {
            self.publish_orchestration(&observed.session);
        }
        let Some(advance) = &observed.reconciled else {
            return;
        };
        if let (Some(session), Some(step_id)) = (advance.session(), advance.completed_step()) {
            let lapsed = session
                .step_results
                .get(step_id)
                .is_some_and(|r| r.status == StepStatus::Expired);
            if lapsed {
                if let Some(data) = EventData::lapsed_step_session(session, step_id) {
                    let event = WebhookEvent::new(EventType::VerificationExpired, data);
                    self.webhooks.dispatch_event(&session.tenant_id, &event);
                }
            }
        }
        self.publish_advance(advance);
    }

    fn publish_step(&self, session: &OrchestrationSession, step_id: &str) {
        let event = WebhookEvent::new(
            EventType::OrchestrationStepCompleted,
            EventData::step_completed(session, step_id),
        );
        self.webhooks.dispatch_event(&session.tenant_id, &event);
    }

    /// Announce a terminal orchestration session to subscribers and to the
    /// definition's `on_complete` target.
    pub fn publish_orchestration(&self, session: &OrchestrationSession) {
        let Some(kind) = EventType::for_orchestration(session.status) else {
            return;
        };
        let event = WebhookEvent::new(kind, EventData::orchestration(session));
        self.webhooks.dispatch_event(&session.tenant_id, &event);
        if let Some(target) = self.engine.completion_target(session) {
            self.webhooks.dispatch_to(target.into(), event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_uses_configured_ttls() {
        let mut config = Config::default();
        config.sessions.ttl_secs = 42;
        let state = AppState::new(config).unwrap();
        assert_eq!(state.sessions.ttl(), Duration::from_secs(42));
    }

    #[test]
    fn new_state_opens_redb_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.backend = StoreBackend::Redb {
            path: dir.path().join("store.redb"),
        };
        let state = AppState::new(config).unwrap();
        state
            .store
            .set("k", b"v", Duration::from_secs(10))
            .unwrap();
        assert!(dir.path().join("store.redb").exists());
    }

    #[test]
    fn new_state_rejects_invalid_seed() {
        let mut config = Config::default();
        config.webhooks.subscriptions = invalid_seed();
        assert!(AppState::new(config).is_err());
    }

    fn invalid_seed() -> Vec<stepwise_core::config::SubscriptionSeed> {
        serde_json::from_value(serde_json::json!([
            { "url": "not-a-url", "events": ["verification.verified"] }
        ]))
        .unwrap()
    }
}
