//! LLM integration
//!
//! [`CompletionService`] is the single seam to any model backend. Two
//! implementations ship: [`OllamaService`] for a local Ollama server and
//! [`ScriptedCompletionService`] for deterministic runs.

pub mod ollama;
pub mod scripted;
pub mod service;
pub mod tool_calls;

pub use ollama::OllamaService;
pub use scripted::ScriptedCompletionService;
pub use service::{
    CompletionError, CompletionRequest, CompletionResponse, CompletionService, DeltaSink, Message,
    Role, StreamDelta, ToolCall, ToolDefinition, Usage,
};
pub use tool_calls::parse_tool_calls_from_text;
