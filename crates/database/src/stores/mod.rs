//! Storage backends

pub mod memory_store;
pub mod redis_store;
pub mod sqlite_store;

pub use memory_store::MemoryChatStore;
pub use redis_store::RedisChatStore;
pub use sqlite_store::SqliteChatStore;
