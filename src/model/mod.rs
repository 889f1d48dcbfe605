//! Model client module for AI inference.

mod client;

pub use client::{
    DecisionService, EncodedImage, MessageBuilder, ModelClient, ModelConfig, ModelError,
    ModelResponse, Pricing, TokenUsage, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS,
};
