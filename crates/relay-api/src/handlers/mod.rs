//! HTTP request handlers.

pub mod health;
pub mod intake;

pub use health::{liveness_check, readiness_check};
pub use intake::{receive_customer, receive_deal_lifecycle};
