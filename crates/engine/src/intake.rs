//! Domain events that turn into notification requests.
//!
//! Other services publish JSON envelopes of the form
//! `{"event": "<name>", "data": {...}}`. Each known event maps to exactly one
//! notification kind and priority; unknown event names are not an error, they
//! are simply not ours.

use serde::Deserialize;
use serde_json::json;

use examhub_common::error::AppError;
use examhub_common::types::{NewNotification, NotificationKind, Priority};

use crate::engine::DispatchMode;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserCreated {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub username: String,
    pub temporary_password: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OtpGenerated {
    pub email: String,
    pub code: String,
    #[serde(default)]
    pub expires_in_minutes: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserRef {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DomainEvent {
    #[serde(rename = "user.created")]
    UserCreated(UserCreated),
    #[serde(rename = "otp.generated")]
    OtpGenerated(OtpGenerated),
    #[serde(rename = "user.password_changed")]
    PasswordChanged(UserRef),
    #[serde(rename = "user.registered")]
    UserRegistered(UserRef),
}

impl DomainEvent {
    pub const NAMES: [&'static str; 4] = [
        "user.created",
        "otp.generated",
        "user.password_changed",
        "user.registered",
    ];

    /// Parse a raw envelope.
    ///
    /// `Ok(None)` for well-formed envelopes naming an event we do not handle.
    /// A known event with a malformed body is a validation error.
    pub fn parse(raw: &str) -> Result<Option<Self>, AppError> {
        let envelope: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| AppError::Validation(format!("Malformed event envelope: {}", e)))?;

        let Some(name) = envelope.get("event").and_then(|v| v.as_str()) else {
            return Err(AppError::Validation(
                "Event envelope has no 'event' name".to_string(),
            ));
        };
        if !Self::NAMES.contains(&name) {
            return Ok(None);
        }

        serde_json::from_value(envelope.clone())
            .map(Some)
            .map_err(|e| AppError::Validation(format!("Malformed '{}' event: {}", name, e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::UserCreated(_) => "user.created",
            DomainEvent::OtpGenerated(_) => "otp.generated",
            DomainEvent::PasswordChanged(_) => "user.password_changed",
            DomainEvent::UserRegistered(_) => "user.registered",
        }
    }

    /// The notification this event asks for, and how eagerly to send it.
    ///
    /// Verification codes are useless once they expire, so they go inline.
    pub fn into_request(self) -> (NewNotification, DispatchMode) {
        match self {
            DomainEvent::UserCreated(e) => (
                NewNotification::new(
                    e.email,
                    NotificationKind::CredentialIssue,
                    json!({
                        "name": e.name,
                        "username": e.username,
                        "password": e.temporary_password,
                    }),
                    Priority::High,
                ),
                DispatchMode::Queued,
            ),
            DomainEvent::OtpGenerated(e) => (
                NewNotification::new(
                    e.email,
                    NotificationKind::VerificationCode,
                    json!({
                        "name": e.name,
                        "code": e.code,
                        "expires_in_minutes": e.expires_in_minutes,
                    }),
                    Priority::High,
                ),
                DispatchMode::Inline,
            ),
            DomainEvent::PasswordChanged(e) => (
                NewNotification::new(
                    e.email,
                    NotificationKind::PasswordReset,
                    json!({ "name": e.name }),
                    Priority::High,
                ),
                DispatchMode::Queued,
            ),
            DomainEvent::UserRegistered(e) => (
                NewNotification::new(
                    e.email,
                    NotificationKind::Welcome,
                    json!({ "name": e.name }),
                    Priority::Normal,
                ),
                DispatchMode::Queued,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otp_event_goes_inline_with_code() {
        let raw = r#"{"event":"otp.generated","data":{"email":"c@example.com","code":"482910","expires_in_minutes":5}}"#;
        let event = DomainEvent::parse(raw).unwrap().unwrap();
        assert_eq!(event.name(), "otp.generated");

        let (request, mode) = event.into_request();
        assert_eq!(mode, DispatchMode::Inline);
        assert_eq!(request.kind, NotificationKind::VerificationCode);
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.payload["code"], "482910");
        assert_eq!(request.payload["expires_in_minutes"], 5);
        assert!(request.kind.validate_payload(&request.payload).is_ok());
    }

    #[test]
    fn test_user_created_maps_to_credentials() {
        let raw = r#"{"event":"user.created","data":{"email":"n@example.com","name":"Nia","username":"nia","temporary_password":"Tmp-1"}}"#;
        let (request, mode) = DomainEvent::parse(raw).unwrap().unwrap().into_request();
        assert_eq!(mode, DispatchMode::Queued);
        assert_eq!(request.recipient, "n@example.com");
        assert_eq!(request.kind, NotificationKind::CredentialIssue);
        assert_eq!(request.payload["password"], "Tmp-1");
        assert!(request.kind.validate_payload(&request.payload).is_ok());
    }

    #[test]
    fn test_registered_and_password_changed() {
        let (welcome, _) =
            DomainEvent::parse(r#"{"event":"user.registered","data":{"email":"w@x"}}"#)
                .unwrap()
                .unwrap()
                .into_request();
        assert_eq!(welcome.kind, NotificationKind::Welcome);
        assert_eq!(welcome.priority, Priority::Normal);

        let (reset, _) =
            DomainEvent::parse(r#"{"event":"user.password_changed","data":{"email":"p@x"}}"#)
                .unwrap()
                .unwrap()
                .into_request();
        assert_eq!(reset.kind, NotificationKind::PasswordReset);
        assert_eq!(reset.priority, Priority::High);
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let parsed =
            DomainEvent::parse(r#"{"event":"exam.published","data":{"id":7}}"#).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_malformed_known_event_is_validation_error() {
        let err = DomainEvent::parse(r#"{"event":"otp.generated","data":{"email":"a@x"}}"#)
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        assert!(DomainEvent::parse("not json").is_err());
        assert!(DomainEvent::parse(r#"{"data":{}}"#).is_err());
    }
}
