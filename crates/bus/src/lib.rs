//! Capability traits the gateway core binds to instead of a concrete bus:
//! `{publish/subscribe}` for events, `{get/set+ttl}` for the ACL cache, and
//! `{enqueue/blocking dequeue}` for delivery jobs. Each trait ships an
//! in-memory double (tests, single-process deployments) and a NATS /
//! JetStream binding.

mod event_bus;
mod kv;
mod queue;

pub use event_bus::{BusSubscription, EventBus, InMemoryEventBus, NatsEventBus, SharedEventBus};
pub use kv::{InMemoryKvStore, KvStore, NatsKvStore, SharedKvStore};
pub use queue::{
    DeliveryResult, InMemoryJobQueue, JobQueue, NatsJobQueue, SharedJobQueue,
};

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
