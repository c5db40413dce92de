//! Model gateway: prompt building, transport and structured-output parsing.

pub mod client;
pub mod gateway;
pub mod parse;
pub mod prompt;

pub use client::{ChatBackend, ChatRequest, OpenRouterClient};
pub use gateway::{DecisionRequest, ModelGateway};
pub use prompt::{ArenaPromptBlock, PortfolioView};
