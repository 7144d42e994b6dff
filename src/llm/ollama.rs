//! Ollama `/api/chat` adapter
//!
//! Streams newline-delimited JSON. A network chunk may hold several lines or
//! end mid-line, so bytes are buffered until a full line is available.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::service::{
    CompletionError, CompletionRequest, CompletionResponse, CompletionService, DeltaSink, Message,
    Role, StreamDelta, ToolCall, Usage,
};
use super::tool_calls::parse_tool_calls_from_text;

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatToolFunction<'a>,
}

#[derive(Debug, Serialize)]
struct ChatToolFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatToolCall {
    function: ChatFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: ChatMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
    #[serde(default)]
    error: Option<String>,
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: m.content.clone(),
            thinking: None,
            tool_calls: m
                .tool_calls
                .iter()
                .map(|c| ChatToolCall {
                    function: ChatFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect(),
        }
    }
}

/// Completion Service backed by a local Ollama server
#[derive(Clone)]
pub struct OllamaService {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn body<'a>(&self, request: &'a CompletionRequest, stream: bool) -> ChatBody<'a> {
        ChatBody {
            model: &request.model,
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            tools: request
                .tools
                .iter()
                .map(|t| ChatTool {
                    kind: "function",
                    function: ChatToolFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
            stream,
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }
}

/// Folds stream chunks into one [`CompletionResponse`]
struct Accumulator<'r> {
    request: &'r CompletionRequest,
    response: CompletionResponse,
}

impl<'r> Accumulator<'r> {
    fn new(request: &'r CompletionRequest, status: u16) -> Self {
        Self {
            request,
            response: CompletionResponse {
                status,
                ..CompletionResponse::default()
            },
        }
    }

    /// Apply one line, forwarding deltas; `false` means the sink aborted
    fn apply(&mut self, chunk: ChatChunk, on_delta: &mut DeltaSink<'_>) -> bool {
        if let Some(error) = chunk.error {
            self.response.error = error;
            return true;
        }
        if let Some(thinking) = chunk.message.thinking.filter(|t| !t.is_empty()) {
            self.response.reasoning.push_str(&thinking);
            if !on_delta(StreamDelta::Reasoning(thinking)) {
                return false;
            }
        }
        if !chunk.message.content.is_empty() {
            self.response.answer.push_str(&chunk.message.content);
            if !on_delta(StreamDelta::Text(chunk.message.content)) {
                return false;
            }
        }
        for call in chunk.message.tool_calls {
            let call = ToolCall {
                id: format!("call_{}", uuid::Uuid::now_v7().simple()),
                name: call.function.name,
                arguments: call.function.arguments,
            };
            self.response.tool_calls.push(call.clone());
            if !on_delta(StreamDelta::ToolCall(call)) {
                return false;
            }
        }
        if chunk.done {
            self.response.usage = Usage {
                prompt_tokens: chunk.prompt_eval_count,
                completion_tokens: chunk.eval_count,
                reasoning_tokens: 0,
                calls: 1,
            };
        }
        true
    }

    fn finish(mut self) -> CompletionResponse {
        if self.response.tool_calls.is_empty() && !self.request.tools.is_empty() {
            let known: Vec<&str> = self.request.tools.iter().map(|t| t.name.as_str()).collect();
            let parsed = parse_tool_calls_from_text(&self.response.answer, &known);
            if !parsed.is_empty() {
                tracing::debug!(count = parsed.len(), "Recovered tool calls from answer text");
                self.response.tool_calls = parsed;
            }
        }
        self.response
    }
}

#[async_trait]
impl CompletionService for OllamaService {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        self.complete_stream(request, &mut |_| true).await
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let started = Instant::now();

        let response = self
            .client
            .post(&endpoint)
            .json(&self.body(request, true))
            .send()
            .await?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status { code: status, message: text });
        }

        let mut acc = Accumulator::new(request, status);
        let mut buffer: Vec<u8> = Vec::new();
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(nl) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=nl).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let parsed: ChatChunk = serde_json::from_slice(&line)?;
                if !acc.apply(parsed, on_delta) {
                    return Err(CompletionError::Aborted);
                }
            }
        }
        if !buffer.iter().all(u8::is_ascii_whitespace) {
            let parsed: ChatChunk = serde_json::from_slice(&buffer)?;
            if !acc.apply(parsed, on_delta) {
                return Err(CompletionError::Aborted);
            }
        }

        let response = acc.finish();
        tracing::debug!(
            model = %request.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            tokens = response.usage.total_tokens(),
            "Ollama chat complete"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::service::ToolDefinition;

    fn chunk(json: &str) -> ChatChunk {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_body_maps_roles_and_tools() {
        let service = OllamaService::new("http://localhost:11434/");
        let request = CompletionRequest {
            model: "llama3.2".into(),
            messages: vec![Message::system("sys"), Message::tool_result("c1", "3")],
            tools: vec![ToolDefinition {
                name: "Add".into(),
                description: "adds".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            temperature: Some(0.0),
            max_tokens: None,
        };
        let json = serde_json::to_value(service.body(&request, true)).unwrap();
        assert_eq!(json["messages"][1]["role"], "tool");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "Add");
        assert!(json["options"].get("num_predict").is_none());
        assert_eq!(service.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_accumulator_joins_deltas_and_usage() {
        let request = CompletionRequest::default();
        let mut acc = Accumulator::new(&request, 200);
        let mut seen = Vec::new();
        let mut sink = |d: StreamDelta| {
            seen.push(d);
            true
        };
        assert!(acc.apply(chunk(r#"{"message":{"role":"assistant","content":"Hel"}}"#), &mut sink));
        assert!(acc.apply(
            chunk(r#"{"message":{"content":"lo"},"done":true,"prompt_eval_count":7,"eval_count":2}"#),
            &mut sink
        ));
        let response = acc.finish();
        assert_eq!(response.answer, "Hello");
        assert_eq!(response.usage.total_tokens(), 9);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_native_tool_calls_get_ids() {
        let request = CompletionRequest::default();
        let mut acc = Accumulator::new(&request, 200);
        let line = r#"{"message":{"tool_calls":[{"function":{"name":"Add","arguments":{"A":1}}}]},"done":true}"#;
        acc.apply(chunk(line), &mut |_| true);
        let response = acc.finish();
        assert_eq!(response.tool_calls.len(), 1);
        assert!(response.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_sink_abort_stops_apply() {
        let request = CompletionRequest::default();
        let mut acc = Accumulator::new(&request, 200);
        assert!(!acc.apply(chunk(r#"{"message":{"content":"x"}}"#), &mut |_| false));
    }
}
