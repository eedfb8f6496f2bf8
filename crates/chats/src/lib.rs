//! # Murmur Chats Crate
//!
//! Business rules in front of a [`murmur_database::ChatStore`]: chat capacity,
//! default TTL, readonly permissions and message retention.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use murmur_chats::{ChatOptions, ChatService};
//! use murmur_database::MemoryChatStore;
//! use uuid::Uuid;
//!
//! # tokio_test_block_on(async {
//! let service = ChatService::new(Arc::new(MemoryChatStore::default()), ChatOptions::default());
//! let chat = service.new_chat(Uuid::new_v4(), false, 60).await.unwrap();
//! service.new_message(chat.id, chat.owner_id, "hello").await.unwrap();
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

pub mod services;
pub mod types;

pub use services::{ChatOptions, ChatService};
pub use types::{ChatError, ChatResult};
