//! Agent Controller - multi-turn LLM loop that calls unit tools
//!
//! Each iteration sends the whole exchange plus the tool definitions,
//! streams the answer to the observer, then runs every requested tool and
//! appends its result. The loop ends when an answer requests no tools, when
//! the iteration or token budget runs out (a soft stop), or as soon as the
//! observer returns `false`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::exchange::ChatExchange;
use super::invoker::{summarize_outputs, ToolInvoker, ToolOutput};
use crate::llm::service::record_latency;
use crate::llm::{
    parse_tool_calls_from_text, CompletionError, CompletionRequest, CompletionService, StreamDelta,
    ToolCall, ToolDefinition, Usage,
};
use crate::metrics::Metrics;
use crate::supervisor::ToolSchema;

pub const DEFAULT_AGENT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to tools. \
Call a tool whenever it can answer part of the request, using exactly the parameters its schema \
declares. When you have everything you need, answer the user directly without calling more tools.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    /// LLM calls per run before a soft stop
    pub max_iterations: usize,
    /// Tokens per run before a soft stop
    pub max_total_tokens: Option<u64>,
    /// Uses [`DEFAULT_AGENT_SYSTEM_PROMPT`] when `None`
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "qwen3".to_string(),
            max_iterations: 10,
            max_total_tokens: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Input of one run
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    /// Earlier turns to continue from
    pub exchange: Option<ChatExchange>,
    pub tools: Vec<ToolSchema>,
}

/// Everything the observer is told while a run is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Iteration(usize),
    Delta(StreamDelta),
    ToolStarted {
        call_id: String,
        name: String,
    },
    ToolFinished {
        call_id: String,
        name: String,
        summary: String,
        failed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An answer requested no tools
    Completed,
    IterationBudget,
    TokenBudget,
    /// The observer returned `false`
    Aborted,
}

#[derive(Debug, Clone)]
pub struct AgentResult {
    pub final_response: String,
    pub exchange: ChatExchange,
    pub iterations: usize,
    pub tool_calls_made: usize,
    /// UI and command payloads emitted by tools, in call order
    pub outputs: Vec<ToolOutput>,
    pub usage: Usage,
    pub stop_reason: StopReason,
    pub trace_id: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("completion failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("session I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Name a unit tool is offered to the model under
pub fn tool_name(schema: &ToolSchema) -> String {
    format!("{}__{}", schema.unit, schema.name)
}

pub struct AgentController {
    completion: Arc<dyn CompletionService>,
    invoker: Arc<dyn ToolInvoker>,
    config: AgentConfig,
    metrics: Option<Arc<Metrics>>,
}

impl AgentController {
    pub fn new(completion: Arc<dyn CompletionService>, invoker: Arc<dyn ToolInvoker>, config: AgentConfig) -> Self {
        Self {
            completion,
            invoker,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run until done, out of budget or aborted by `observer`
    pub async fn run<F>(&self, request: AgentRequest, mut observer: F) -> Result<AgentResult, AgentError>
    where
        F: FnMut(AgentEvent) -> bool + Send,
    {
        let trace_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_task",
            trace_id = %trace_id,
            model = %self.config.model,
            tools = request.tools.len(),
            otel.name = "agent_task"
        );
        self.run_loop(request, &mut observer, trace_id)
            .instrument(root_span)
            .await
    }

    async fn run_loop(
        &self,
        request: AgentRequest,
        observer: &mut (dyn FnMut(AgentEvent) -> bool + Send),
        trace_id: String,
    ) -> Result<AgentResult, AgentError> {
        info!(prompt_len = request.prompt.len(), "Starting agent task");

        let system = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_AGENT_SYSTEM_PROMPT.to_string());
        let by_name: HashMap<String, &ToolSchema> = request.tools.iter().map(|t| (tool_name(t), t)).collect();
        let definitions: Vec<ToolDefinition> = request
            .tools
            .iter()
            .map(|t| ToolDefinition {
                name: tool_name(t),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();
        let known: Vec<&str> = by_name.keys().map(String::as_str).collect();

        let mut result = AgentResult {
            final_response: String::new(),
            exchange: request.exchange.unwrap_or_default(),
            iterations: 0,
            tool_calls_made: 0,
            outputs: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::Completed,
            trace_id,
        };
        result.exchange.push_user(request.prompt);

        loop {
            if result.iterations >= self.config.max_iterations {
                warn!(iterations = result.iterations, "Iteration budget exhausted");
                return Ok(self.finish(result, StopReason::IterationBudget));
            }
            if let Some(limit) = self.config.max_total_tokens {
                if result.usage.total_tokens() >= limit {
                    warn!(used = result.usage.total_tokens(), limit, "Token budget exhausted");
                    return Ok(self.finish(result, StopReason::TokenBudget));
                }
            }

            result.iterations += 1;
            if !observer(AgentEvent::Iteration(result.iterations)) {
                return Ok(self.finish(result, StopReason::Aborted));
            }

            let call = CompletionRequest {
                model: self.config.model.clone(),
                messages: result.exchange.to_messages(&system),
                tools: definitions.clone(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };
            let llm_span = info_span!(
                "llm_call",
                iteration = result.iterations,
                model = %self.config.model,
                otel.name = "llm_call"
            );
            let started = Instant::now();
            let streamed = self
                .completion
                .complete_stream(&call, &mut |delta| observer(AgentEvent::Delta(delta)))
                .instrument(llm_span)
                .await;
            record_latency(self.metrics.as_deref(), &self.config.model, started);

            let response = match streamed.and_then(|r| r.into_result()) {
                Ok(response) => response,
                Err(CompletionError::Aborted) => return Ok(self.finish(result, StopReason::Aborted)),
                Err(e) => {
                    warn!(iteration = result.iterations, error = %e, "LLM call failed");
                    return Err(e.into());
                }
            };
            result.usage.add(&response.usage);
            info!(
                iteration = result.iterations,
                duration_ms = started.elapsed().as_secs_f64() * 1000.0,
                tokens = response.usage.total_tokens(),
                "LLM call completed"
            );

            let tool_calls = if response.tool_calls.is_empty() && !known.is_empty() {
                parse_tool_calls_from_text(&response.answer, &known)
            } else {
                response.tool_calls.clone()
            };
            result.final_response = response.answer.clone();
            result
                .exchange
                .push_assistant(response.reasoning, response.answer, tool_calls.clone());

            if tool_calls.is_empty() {
                info!(
                    iterations = result.iterations,
                    tool_calls = result.tool_calls_made,
                    "Agent task completed"
                );
                return Ok(self.finish(result, StopReason::Completed));
            }

            for call in tool_calls {
                if !self.run_tool(&call, &by_name, &mut result, observer).await {
                    return Ok(self.finish(result, StopReason::Aborted));
                }
            }
        }
    }

    /// Invoke one tool call and append its result; `false` means abort
    async fn run_tool(
        &self,
        call: &ToolCall,
        by_name: &HashMap<String, &ToolSchema>,
        result: &mut AgentResult,
        observer: &mut (dyn FnMut(AgentEvent) -> bool + Send),
    ) -> bool {
        if !observer(AgentEvent::ToolStarted {
            call_id: call.id.clone(),
            name: call.name.clone(),
        }) {
            return false;
        }
        result.tool_calls_made += 1;
        if let Some(m) = &self.metrics {
            m.agent_tool_calls.with_label_values(&[call.name.as_str()]).inc();
        }

        let outcome = match by_name.get(&call.name) {
            Some(schema) => {
                let span = info_span!("tool_call", tool = %call.name, call_id = %call.id, otel.name = "tool_call");
                self.invoker
                    .invoke(schema, &call.arguments)
                    .instrument(span)
                    .await
                    .map(|output| (summarize_outputs(&output.data, &schema.outputs), output))
            }
            None => Err(format!("unknown tool: {}", call.name)),
        };

        let (summary, failed) = match outcome {
            Ok((summary, output)) => {
                info!(tool = %call.name, "Tool call succeeded");
                if !output.ui.is_empty() || !output.cmds.is_empty() {
                    result.outputs.push(output);
                }
                (summary, false)
            }
            Err(error) => {
                warn!(tool = %call.name, error = %error, "Tool call failed");
                (format!("Error: {error}"), true)
            }
        };

        if !observer(AgentEvent::ToolFinished {
            call_id: call.id.clone(),
            name: call.name.clone(),
            summary: summary.clone(),
            failed,
        }) {
            return false;
        }
        result.exchange.push_tool_result(&call.id, &call.name, summary);
        true
    }

    fn finish(&self, mut result: AgentResult, reason: StopReason) -> AgentResult {
        if let Some(m) = &self.metrics {
            m.agent_iterations.observe(result.iterations as f64);
        }
        if reason != StopReason::Completed && result.final_response.is_empty() {
            result.final_response = result.exchange.last_answer().unwrap_or_default().to_string();
        }
        result.stop_reason = reason;
        result
    }
}
