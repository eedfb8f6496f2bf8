//! Shared types and result types for the storage layer

pub mod errors;
pub mod events;

pub use errors::{StoreError, Stored};
pub use events::OutboxEvent;

pub type StoreResult<T> = Result<T, StoreError>;
