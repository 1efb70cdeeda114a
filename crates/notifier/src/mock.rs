//! Mock email gateway for testing

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::gateway::{DeliveryError, EmailGateway, OutboundEmail, SendReceipt};

/// What the mock does on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Deliver,
    Transient(String),
    Permanent(String),
    /// Never return; exercises the engine's send timeout.
    Hang,
}

/// Scriptable gateway that records every attempt it receives.
///
/// Outcomes are taken from the script in order; once it runs out the
/// fallback outcome repeats.
pub struct MockGateway {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    delay: Option<Duration>,
    attempts: Mutex<Vec<OutboundEmail>>,
    calls: AtomicUsize,
}

impl MockGateway {
    /// A gateway that delivers everything.
    pub fn new() -> Self {
        Self::with_fallback(MockOutcome::Deliver)
    }

    /// A gateway that fails every call with a retryable error.
    pub fn failing_transient(message: impl Into<String>) -> Self {
        Self::with_fallback(MockOutcome::Transient(message.into()))
    }

    /// A gateway that rejects every call permanently.
    pub fn failing_permanent(message: impl Into<String>) -> Self {
        Self::with_fallback(MockOutcome::Permanent(message.into()))
    }

    /// Play `outcomes` in order, then deliver.
    pub fn scripted(outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        let gateway = Self::new();
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            ..gateway
        }
    }

    pub fn with_fallback(fallback: MockOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            attempts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every message handed to `send`, in call order.
    pub async fn attempts(&self) -> Vec<OutboundEmail> {
        self.attempts.lock().await.clone()
    }

    /// Number of `send` calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of attempts addressed to `to`.
    pub async fn attempts_to(&self, to: &str) -> usize {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|email| email.to == to)
            .count()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailGateway for MockGateway {
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempts.lock().await.push(email.clone());

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            MockOutcome::Deliver => Ok(SendReceipt {
                provider_message_id: format!("mock-{}", call),
            }),
            MockOutcome::Transient(message) => Err(DeliveryError::Transient(message)),
            MockOutcome::Permanent(message) => Err(DeliveryError::Permanent(message)),
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(DeliveryError::Transient("unreachable".to_string()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use examhub_common::types::NotificationKind;

    fn email(to: &str) -> OutboundEmail {
        crate::render::render(to, NotificationKind::Welcome, &serde_json::json!({})).unwrap()
    }

    #[tokio::test]
    async fn test_mock_delivers_by_default() {
        let gateway = MockGateway::new();
        let receipt = gateway.send(&email("a@example.com")).await.unwrap();
        assert_eq!(receipt.provider_message_id, "mock-1");
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(gateway.attempts_to("a@example.com").await, 1);
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let gateway = MockGateway::scripted([
            MockOutcome::Transient("busy".into()),
            MockOutcome::Permanent("bounced".into()),
        ]);
        assert_eq!(
            gateway.send(&email("a@example.com")).await.unwrap_err(),
            DeliveryError::Transient("busy".into())
        );
        assert_eq!(
            gateway.send(&email("a@example.com")).await.unwrap_err(),
            DeliveryError::Permanent("bounced".into())
        );
        assert!(gateway.send(&email("a@example.com")).await.is_ok());
        assert_eq!(gateway.attempts().await.len(), 3);
    }

    #[tokio::test]
    async fn test_failing_transient() {
        let gateway = MockGateway::failing_transient("smtp down");
        let err = gateway.send(&email("b@example.com")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
