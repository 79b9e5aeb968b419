//! patcher-backend: reasoning backends for repo-patcher
//!
//! [`ChatBackend`] implements [`patcher_core::ReasoningBackend`] over any
//! OpenAI-compatible chat completions endpoint and prices each response
//! with the table in [`pricing`].

pub mod chat;
pub mod config;
pub mod error;
pub mod pricing;

pub use chat::ChatBackend;
pub use config::ChatConfig;
pub use error::ConfigError;
pub use pricing::{cost_of, price_for, ModelPrice};
