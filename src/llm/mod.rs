//! Opaque LLM capability: request types, error taxonomy, client trait

pub mod client;
pub mod error;
pub mod types;

pub use client::ModelClient;
pub use client::mock::MockModelClient;
pub use error::ModelError;
pub use types::{ModelRequest, ThinkingLevel, model_timeout};
