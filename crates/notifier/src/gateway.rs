//! The delivery provider seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use examhub_common::types::{FailureClass, NotificationKind};

/// A rendered message ready to hand to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub kind: NotificationKind,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Successful hand-off to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-assigned message identifier.
    pub provider_message_id: String,
}

/// Delivery failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Provider timeout, 5xx-equivalent or network failure. Worth retrying.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Recipient rejected or content unsupported. Retrying cannot help.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// The call did not finish within the engine's send timeout.
    #[error("delivery timed out after {0}s")]
    Timeout(u64),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Permanent(_))
    }

    pub fn class(&self) -> FailureClass {
        if self.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        }
    }
}

/// Trait for email delivery providers.
#[async_trait]
pub trait EmailGateway: Send + Sync {
    /// Deliver one message. Implementations must not retry internally; the
    /// engine owns attempt accounting.
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, DeliveryError>;

    /// Provider name, for logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(DeliveryError::Transient("503".into()).is_retryable());
        assert!(DeliveryError::Timeout(30).is_retryable());
        assert!(!DeliveryError::Permanent("bad address".into()).is_retryable());

        assert_eq!(DeliveryError::Timeout(5).class(), FailureClass::Transient);
        assert_eq!(
            DeliveryError::Permanent("x".into()).class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            DeliveryError::Timeout(30).to_string(),
            "delivery timed out after 30s"
        );
    }
}
