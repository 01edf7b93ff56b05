//! Outbound webhook delivery: a durable job queue drives HTTP POSTs with
//! exponential backoff, HMAC signing, per-destination circuit breakers and
//! bounded retry. Failures never surface to any request; the delivery
//! record tracks the outcome.

mod breaker;
mod payload;
mod signer;
mod worker;

pub use breaker::{BreakerRegistry, BreakerSettings, CircuitBreaker};
pub use payload::build_payload;
pub use signer::{sign, verify};
pub use worker::{requeue_due, WorkerConfig, WorkerPool};
