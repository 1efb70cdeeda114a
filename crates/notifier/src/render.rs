//! Per-kind message rendering with Handlebars.
//!
//! Adding a kind to `NotificationKind` forces a new arm in [`templates_for`],
//! so every kind the engine accepts has a template. Subjects and text bodies
//! are rendered verbatim; HTML bodies go through Handlebars' HTML escaping.

use std::sync::LazyLock;

use handlebars::Handlebars;
use serde_json::{Map, Value, json};

use examhub_common::types::NotificationKind;

use crate::gateway::{DeliveryError, OutboundEmail};

/// Default validity shown for verification codes when the payload omits it.
const DEFAULT_CODE_EXPIRY_MINUTES: u64 = 10;

const DEFAULT_NAME: &str = "candidate";

struct KindTemplates {
    subject: &'static str,
    text: &'static str,
    html: &'static str,
}

fn templates_for(kind: NotificationKind) -> KindTemplates {
    match kind {
        NotificationKind::VerificationCode => KindTemplates {
            subject: "Your ExamHub verification code",
            text: "Hello {{name}},\n\
                   Your verification code is {{code}}.\n\
                   It expires in {{expires_in_minutes}} minutes.",
            html: "<p>Hello {{name}},</p>\
                   <p>Your verification code is <strong>{{code}}</strong>.</p>\
                   <p>It expires in {{expires_in_minutes}} minutes.</p>",
        },
        NotificationKind::Welcome => KindTemplates {
            subject: "Welcome to ExamHub",
            text: "Hello {{name}},\n\
                   Your ExamHub account is ready. You can now register for proficiency exams.",
            html: "<p>Hello {{name}},</p>\
                   <p>Your ExamHub account is ready. You can now register for proficiency exams.</p>",
        },
        NotificationKind::CredentialIssue => KindTemplates {
            subject: "Your ExamHub account credentials",
            text: "Hello {{name}},\n\
                   Username: {{username}}\n\
                   Temporary password: {{password}}\n\
                   Please change your password after your first sign-in.",
            html: "<p>Hello {{name}},</p>\
                   <p>Username: <strong>{{username}}</strong></p>\
                   <p>Temporary password: <strong>{{password}}</strong></p>\
                   <p>Please change your password after your first sign-in.</p>",
        },
        NotificationKind::PasswordReset => KindTemplates {
            subject: "Your ExamHub password was changed",
            text: "Hello {{name}},\n\
                   The password for your ExamHub account was just changed.\n\
                   If this was not you, contact your exam centre immediately.",
            html: "<p>Hello {{name}},</p>\
                   <p>The password for your ExamHub account was just changed.</p>\
                   <p>If this was not you, contact your exam centre immediately.</p>",
        },
    }
}

/// Compiled templates for every kind, split by escaping mode.
struct Templates {
    plain: Handlebars<'static>,
    html: Handlebars<'static>,
}

impl Templates {
    fn new() -> Result<Self, handlebars::TemplateError> {
        let mut plain = Handlebars::new();
        plain.register_escape_fn(handlebars::no_escape);
        let mut html = Handlebars::new();

        for kind in NotificationKind::ALL {
            let templates = templates_for(kind);
            plain.register_template_string(&subject_name(kind), templates.subject)?;
            plain.register_template_string(&text_name(kind), templates.text)?;
            html.register_template_string(kind.as_str(), templates.html)?;
        }

        Ok(Self { plain, html })
    }
}

fn subject_name(kind: NotificationKind) -> String {
    format!("{}_subject", kind.as_str())
}

fn text_name(kind: NotificationKind) -> String {
    format!("{}_text", kind.as_str())
}

static TEMPLATES: LazyLock<Result<Templates, String>> =
    LazyLock::new(|| Templates::new().map_err(|e| e.to_string()));

/// Render a notification into a sendable email.
///
/// A template that cannot render will not render on retry either, so
/// failures are permanent.
pub fn render(
    recipient: &str,
    kind: NotificationKind,
    payload: &Value,
) -> Result<OutboundEmail, DeliveryError> {
    let templates = TEMPLATES
        .as_ref()
        .map_err(|e| DeliveryError::Permanent(format!("templates unavailable: {}", e)))?;
    let data = template_data(payload);

    let rendering_failed =
        |e: handlebars::RenderError| DeliveryError::Permanent(format!("rendering failed: {}", e));

    Ok(OutboundEmail {
        to: recipient.to_string(),
        kind,
        subject: templates
            .plain
            .render(&subject_name(kind), &data)
            .map_err(rendering_failed)?,
        html_body: templates
            .html
            .render(kind.as_str(), &data)
            .map_err(rendering_failed)?,
        text_body: templates
            .plain
            .render(&text_name(kind), &data)
            .map_err(rendering_failed)?,
    })
}

/// The payload with display defaults filled in for absent or null fields.
fn template_data(payload: &Value) -> Value {
    let mut data = match payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, default) in [
        ("name", json!(DEFAULT_NAME)),
        ("expires_in_minutes", json!(DEFAULT_CODE_EXPIRY_MINUTES)),
    ] {
        if data.get(key).is_none_or(Value::is_null) {
            data.insert(key.to_string(), default);
        }
    }
    Value::Object(data)
}
