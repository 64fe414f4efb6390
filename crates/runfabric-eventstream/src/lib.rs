//! Per-run event log fabric (spec §4.5): an abstract append/read-from/TTL
//! log store plus the typed publisher/consumer pair that rides on top of it.

mod consumer;
mod publisher;
mod store;

#[cfg(feature = "redis-streams")]
mod redis_store;

pub use consumer::{AgentStreamConsumer, ConsumerEvent, ConsumerOptions};
pub use publisher::AgentStreamPublisher;
pub use store::{EventLogStore, InMemoryLogStore};

#[cfg(feature = "redis-streams")]
pub use redis_store::RedisStreamLogStore;
