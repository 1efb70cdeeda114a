//! Resend email provider.
//!
//! Sends email via the Resend HTTP API and classifies failures by status code.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::gateway::{DeliveryError, EmailGateway, OutboundEmail, SendReceipt};

/// Resend email provider.
pub struct ResendGateway {
    api_key: String,
    api_url: String,
    from: String,
    client: Client,
}

/// Resend API request payload
#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

impl ResendGateway {
    pub fn new(
        api_key: impl Into<String>,
        api_url: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: api_url.into(),
            from: from.into(),
            client: Client::new(),
        }
    }

    /// Map a non-success HTTP status to the retry taxonomy.
    ///
    /// 408, 429 and 5xx are transient; every other 4xx means the provider
    /// will keep refusing this message.
    fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
        let message = format!("provider returned {}: {}", status, body.trim());
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            DeliveryError::Transient(message)
        } else {
            DeliveryError::Permanent(message)
        }
    }
}

#[async_trait]
impl EmailGateway for ResendGateway {
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, DeliveryError> {
        let request = ResendRequest {
            from: &self.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html_body,
            text: &email.text_body,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = Self::classify_status(status, &body);
            tracing::debug!(
                to = %email.to,
                status = status.as_u16(),
                retryable = error.is_retryable(),
                "Resend rejected message"
            );
            return Err(error);
        }

        // The message was accepted even if the body is unreadable, but without an
        // id we cannot record it as sent.
        let body: ResendResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("unreadable provider response: {}", e)))?;

        Ok(SendReceipt {
            provider_message_id: body.id,
        })
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}
