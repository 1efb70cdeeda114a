//! Background side of the notification service: Redis Streams event intake
//! and delivery-event publishing. The scheduler itself lives in the engine.

pub mod consumer;
pub mod publisher;
