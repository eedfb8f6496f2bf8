//! Business logic services for the chat system.

pub mod chat_service;

pub use chat_service::{ChatOptions, ChatService};
