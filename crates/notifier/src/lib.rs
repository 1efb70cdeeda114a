//! Email delivery for ExamHub notifications.
//!
//! The engine talks to the provider only through [`EmailGateway`]:
//! - [`render`] turns a notification kind + payload into subject and bodies
//! - [`resend::ResendGateway`] delivers through the Resend HTTP API
//! - [`mock::MockGateway`] is a scriptable stand-in for tests and local runs

pub mod gateway;
pub mod mock;
pub mod render;
pub mod resend;

pub use gateway::{DeliveryError, EmailGateway, OutboundEmail, SendReceipt};
