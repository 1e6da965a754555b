//! LLM client abstraction.
//!
//! The controller never talks to a provider directly. The LLM-backed adapters
//! in [`crate::adapters::llm`] take any [`LLMClient`] implementation.

mod client;
mod types;

pub use client::{parse_probability_from_text, LLMClient};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, StopReason, TokenUsage,
};
