//! LLM provider adapters.
//!
//! Each provider implements the backend trait for its specific API.

mod anthropic;

pub use anthropic::{AnthropicBackend, AnthropicBackendBuilder, DEFAULT_BASE_URL, DEFAULT_MAX_TOKENS};
