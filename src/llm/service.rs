//! The Completion Service interface
//!
//! Every LLM backend is consumed through [`CompletionService`]; the code
//! generation and agentic loops never build vendor payloads themselves.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A tool the model may call, described by a JSON Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One message of the flattened conversation sent to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Token accounting, summed across calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
    pub calls: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.calls += other.calls;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens + self.reasoning_tokens
    }
}

/// `(answer, reasoning, tool calls, usage, status, error)`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: String,
}

impl CompletionResponse {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            answer: text.into(),
            status: 200,
            usage: Usage {
                calls: 1,
                ..Usage::default()
            },
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// Turn a non-success status or embedded error into [`CompletionError`]
    pub fn into_result(self) -> Result<Self, CompletionError> {
        if !self.error.is_empty() || !(200..300).contains(&self.status) {
            return Err(CompletionError::Status {
                code: self.status,
                message: self.error,
            });
        }
        Ok(self)
    }
}

/// Incremental output delivered while a streaming call is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Reasoning(String),
    Text(String),
    ToolCall(ToolCall),
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion service returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("completion request failed: {0}")]
    Request(String),

    #[error("failed to parse completion response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0} is not supported by this completion service")]
    Unsupported(&'static str),

    #[error("stream aborted by observer")]
    Aborted,
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        CompletionError::Request(e.to_string())
    }
}

/// Callback receiving stream deltas; returning `false` aborts the stream
pub type DeltaSink<'a> = dyn FnMut(StreamDelta) -> bool + Send + 'a;

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CompletionError>;

    /// Streaming variant; the default replays a non-streaming answer as deltas
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let response = self.complete(request).await?;
        if !response.reasoning.is_empty() && !on_delta(StreamDelta::Reasoning(response.reasoning.clone())) {
            return Err(CompletionError::Aborted);
        }
        if !response.answer.is_empty() && !on_delta(StreamDelta::Text(response.answer.clone())) {
            return Err(CompletionError::Aborted);
        }
        for call in &response.tool_calls {
            if !on_delta(StreamDelta::ToolCall(call.clone())) {
                return Err(CompletionError::Aborted);
            }
        }
        Ok(response)
    }

    async fn transcribe(&self, _audio: &[u8]) -> Result<String, CompletionError> {
        Err(CompletionError::Unsupported("transcribe"))
    }

    async fn speak(&self, _text: &str) -> Result<Vec<u8>, CompletionError> {
        Err(CompletionError::Unsupported("speak"))
    }
}

pub(crate) fn record_latency(metrics: Option<&Metrics>, model: &str, started: Instant) {
    if let Some(m) = metrics {
        m.llm_call_duration
            .with_label_values(&[model])
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_error_is_status_error() {
        let response = CompletionResponse {
            status: 200,
            error: "model overloaded".into(),
            ..CompletionResponse::default()
        };
        match response.into_result() {
            Err(CompletionError::Status { code, message }) => {
                assert_eq!(code, 200);
                assert_eq!(message, "model overloaded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_success_status_is_error() {
        let response = CompletionResponse {
            status: 429,
            ..CompletionResponse::default()
        };
        assert!(response.into_result().is_err());
        assert!(CompletionResponse::answer("ok").into_result().is_ok());
    }

    #[test]
    fn test_request_json_omits_empty_fields() {
        let request = CompletionRequest {
            model: "m".into(),
            messages: vec![Message::user("hi")],
            ..CompletionRequest::default()
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["messages"][0].get("tool_calls").is_none());
    }
}
