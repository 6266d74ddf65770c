//! Asynchronous webhook delivery.
//!
//! Every delivery is its own tokio task. The producer gets the task handle
//! back and never waits on it; retries sleep on a tokio timer inside the
//! task. A delivery that exhausts its attempts is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stepwise_core::config::WebhooksConfig;
use stepwise_core::orchestration::CompletionTarget;
use stepwise_core::webhook::{
    sign_payload, SubscriptionRegistry, WebhookEvent, WebhookSubscription, DELIVERY_HEADER,
    EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before retry n (1-based); the last entry repeats.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WebhooksConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &WebhooksConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            delays: cfg
                .retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

/// Where one delivery goes.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub url: String,
    pub secret: String,
    pub subscription_id: Option<String>,
}

impl From<&WebhookSubscription> for DeliveryTarget {
    fn from(s: &WebhookSubscription) -> Self {
        Self {
            url: s.url.clone(),
            secret: s.secret.clone(),
            subscription_id: Some(s.id.clone()),
        }
    }
}

impl From<CompletionTarget> for DeliveryTarget {
    fn from(t: CompletionTarget) -> Self {
        Self {
            url: t.url,
            secret: t.secret,
            subscription_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub url: String,
    pub delivery_id: String,
    pub attempts: u32,
    pub delivered: bool,
    pub last_status: Option<u16>,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    subscriptions: Arc<SubscriptionRegistry>,
    policy: Arc<RetryPolicy>,
}

impl WebhookDispatcher {
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            subscriptions,
            policy: Arc::new(policy),
        })
    }

    /// Fan `event` out to every enabled subscription of `tenant_id` that
    /// wants it.
    pub fn dispatch_event(
        &self,
        tenant_id: &str,
        event: &WebhookEvent,
    ) -> Vec<JoinHandle<DeliveryReport>> {
        self.subscriptions
            .matching(tenant_id, event.event)
            .iter()
            .map(|s| self.dispatch_to(s.into(), event.clone()))
            .collect()
    }

    /// Deliver `event` to a single target.
    pub fn dispatch_to(
        &self,
        target: DeliveryTarget,
        event: WebhookEvent,
    ) -> JoinHandle<DeliveryReport> {
        tokio::spawn(deliver(
            self.client.clone(),
            self.policy.clone(),
            target,
            event,
        ))
    }
}

async fn deliver(
    client: reqwest::Client,
    policy: Arc<RetryPolicy>,
    target: DeliveryTarget,
    event: WebhookEvent,
) -> DeliveryReport {
    let delivery_id = uuid::Uuid::new_v4().to_string();
    let mut report = DeliveryReport {
        url: target.url.clone(),
        delivery_id: delivery_id.clone(),
        attempts: 0,
        delivered: false,
        last_status: None,
    };

    let body = match serde_json::to_string(&event) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, event = %event.event, "webhook payload encoding failed");
            return report;
        }
    };

    loop {
        report.attempts += 1;
        // re-signed per attempt so the timestamp stays fresh
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(&target.secret, timestamp, &body);

        let sent = client
            .post(&target.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(EVENT_HEADER, event.event.as_str())
            .header(DELIVERY_HEADER, &delivery_id)
            .body(body.clone())
            .send()
            .await;

        match sent {
            Ok(resp) if resp.status().is_success() => {
                report.delivered = true;
                report.last_status = Some(resp.status().as_u16());
                tracing::debug!(
                    url = %target.url,
                    event = %event.event,
                    attempts = report.attempts,
                    "webhook delivered"
                );
                return report;
            }
            Ok(resp) => {
                report.last_status = Some(resp.status().as_u16());
                tracing::warn!(
                    url = %target.url,
                    event = %event.event,
                    attempt = report.attempts,
                    status = resp.status().as_u16(),
                    "webhook rejected"
                );
            }
            Err(e) => {
                tracing::warn!(
                    url = %target.url,
                    event = %event.event,
                    attempt = report.attempts,
                    error = %e,
                    "webhook delivery failed"
                );
            }
        }

        if report.attempts >= policy.max_attempts {
            tracing::warn!(
                url = %target.url,
                event = %event.event,
                subscription = target.subscription_id.as_deref().unwrap_or("-"),
                attempts = report.attempts,
                "webhook abandoned"
            );
            return report;
        }
        tokio::time::sleep(policy.delay_after(report.attempts)).await;
    }
}
