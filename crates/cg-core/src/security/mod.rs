//! Security audit trail: sanitized JSON-lines events and threshold alerting.

pub mod audit;
pub mod monitor;
pub mod sanitize;
