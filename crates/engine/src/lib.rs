//! Notification delivery engine.
//!
//! Control flow: a caller or the event intake submits through
//! [`engine::NotificationEngine`], which persists the record in a
//! [`store::NotificationStore`]. The [`scheduler::Scheduler`] drives dispatch
//! passes that claim records through the [`queue::DeliveryQueue`] and hand them
//! to the email gateway, and reconciliation passes that requeue backed-off
//! failures.

pub mod bootstrap;
pub mod clock;
pub mod engine;
pub mod intake;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod store;
