//! Delivery side of the outbox: a [`MessageBus`] abstraction with its
//! adapters and the [`Publisher`] loop that drains an [`OutboxQueue`].
//!
//! [`OutboxQueue`]: murmur_database::OutboxQueue

pub mod bus;
pub mod publisher;

pub use bus::{BusError, LogBus, MessageBus, RedisStreamBus};
pub use publisher::{Delivery, Publisher, PublisherOptions};
