//! Integration tests for the agentic loop
//!
//! The model is scripted. Most tests use an in-memory invoker; the last one
//! drives real tools through a supervised `demo_tools` guest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use toolsmith::agent::{
    tool_name, AgentConfig, AgentController, AgentEvent, AgentRequest, ChatExchange, StopReason,
    SupervisorInvoker, ToolInvoker, ToolOutput, Turn,
};
use toolsmith::llm::{CompletionResponse, Role, ScriptedCompletionService, StreamDelta, ToolCall, Usage};
use toolsmith::registry::{ActionKind, CallFrame, MessageRegistry};
use toolsmith::supervisor::{
    CargoToolchain, HostContext, OutputField, Supervisor, SupervisorSettings, ToolSchema, UnitTree,
};

fn add_schema() -> ToolSchema {
    ToolSchema {
        unit: "Demo".into(),
        name: "Add".into(),
        description: "Adds A and B".into(),
        parameters: json!({
            "type": "object",
            "properties": {"A": {"type": "number"}, "B": {"type": "number"}}
        }),
        outputs: vec![OutputField {
            name: "Out_Sum".into(),
            ty: "f64".into(),
        }],
    }
}

fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments,
    }
}

/// Answers Add in memory and fails everything else
#[derive(Default)]
struct MemoryInvoker {
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ToolInvoker for MemoryInvoker {
    async fn invoke(&self, tool: &ToolSchema, arguments: &Value) -> Result<ToolOutput, String> {
        self.calls.lock().push((tool.name.clone(), arguments.clone()));
        if tool.name != "Add" {
            return Err(format!("{} is broken", tool.name));
        }
        let a = arguments["A"].as_f64().unwrap_or_default();
        let b = arguments["B"].as_f64().unwrap_or_default();
        Ok(ToolOutput {
            data: serde_json::to_vec(&json!({"A": a, "B": b, "Out_Sum": a + b})).map_err(|e| e.to_string())?,
            ui: b"[sum]".to_vec(),
            cmds: Vec::new(),
        })
    }
}

fn controller(
    model: &Arc<ScriptedCompletionService>,
    invoker: &Arc<MemoryInvoker>,
    config: AgentConfig,
) -> AgentController {
    AgentController::new(model.clone(), invoker.clone(), config)
}

#[test]
fn test_agent_config_defaults() {
    let config = AgentConfig::default();
    assert_eq!(config.model, "qwen3");
    assert_eq!(config.max_iterations, 10);
    assert!(config.max_total_tokens.is_none());
    assert!(config.system_prompt.is_none());
}

#[test]
fn test_tool_names_are_unit_qualified() {
    assert_eq!(tool_name(&add_schema()), "Demo__Add");
}

/// An answer without tool calls finishes on the first iteration
#[tokio::test]
async fn test_plain_answer_completes_immediately() {
    let model = Arc::new(ScriptedCompletionService::from_answers(["Paris."]));
    let invoker = Arc::new(MemoryInvoker::default());
    let agent = controller(&model, &invoker, AgentConfig::default());

    let mut events = Vec::new();
    let result = agent
        .run(
            AgentRequest {
                prompt: "Capital of France?".into(),
                ..AgentRequest::default()
            },
            |event| {
                events.push(event);
                true
            },
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.tool_calls_made, 0);
    assert_eq!(result.final_response, "Paris.");
    assert_eq!(result.exchange.len(), 2);
    assert!(!result.trace_id.is_empty());
    assert_eq!(
        events,
        vec![
            AgentEvent::Iteration(1),
            AgentEvent::Delta(StreamDelta::Text("Paris.".into())),
        ]
    );

    let request = &model.requests()[0];
    assert_eq!(request.messages[0].role, Role::System);
    assert_eq!(request.messages[1].content, "Capital of France?");
    assert!(request.tools.is_empty());
    assert!(invoker.calls.lock().is_empty());
}

#[tokio::test]
async fn test_tool_call_then_answer() {
    let model = Arc::new(ScriptedCompletionService::new());
    model.push(
        CompletionResponse::answer("")
            .with_tool_calls(vec![call("c1", "Demo__Add", json!({"A": 1, "B": 2}))]),
    );
    model.push(CompletionResponse::answer("The sum is 3."));
    let invoker = Arc::new(MemoryInvoker::default());
    let agent = controller(&model, &invoker, AgentConfig::default());

    let mut finished = Vec::new();
    let result = agent
        .run(
            AgentRequest {
                prompt: "What is 1 + 2?".into(),
                exchange: None,
                tools: vec![add_schema()],
            },
            |event| {
                if let AgentEvent::ToolFinished { summary, failed, .. } = event {
                    finished.push((summary, failed));
                }
                true
            },
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.tool_calls_made, 1);
    assert_eq!(result.final_response, "The sum is 3.");
    assert_eq!(finished, vec![("3.0".to_string(), false)]);
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs[0].ui, b"[sum]");
    assert!(result.exchange.is_resolved());

    let calls = invoker.calls.lock().clone();
    assert_eq!(calls, vec![("Add".to_string(), json!({"A": 1, "B": 2}))]);

    let requests = model.requests();
    assert_eq!(requests[0].tools[0].name, "Demo__Add");
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
    assert_eq!(last.content, "3.0");
}

/// Calls printed as text in separate answers still resolve one-to-one
#[tokio::test]
async fn test_text_tool_calls_across_iterations() {
    let model = Arc::new(ScriptedCompletionService::from_answers([
        r#"{"name": "Demo__Add", "arguments": {"A": 1, "B": 2}}"#,
        r#"{"name": "Demo__Add", "arguments": {"A": 3, "B": 4}}"#,
        "Done.",
    ]));
    let invoker = Arc::new(MemoryInvoker::default());
    let agent = controller(&model, &invoker, AgentConfig::default());

    let result = agent
        .run(
            AgentRequest {
                prompt: "Add twice".into(),
                exchange: None,
                tools: vec![add_schema()],
            },
            |_| true,
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.tool_calls_made, 2);
    assert!(result.exchange.is_resolved(), "{:?}", result.exchange.unresolved_calls());

    let ids: Vec<String> = result
        .exchange
        .turns
        .iter()
        .filter_map(|t| match t {
            Turn::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
}

/// Failures and unknown tools come back to the model as `Error:` results
#[tokio::test]
async fn test_tool_errors_are_reported_to_the_model() {
    let model = Arc::new(ScriptedCompletionService::new());
    let mut broken = add_schema();
    broken.name = "Div".into();
    model.push(CompletionResponse::answer("").with_tool_calls(vec![
        call("c1", "Demo__Div", json!({"A": 1, "B": 0})),
        call("c2", "Demo__Nope", json!({})),
    ]));
    model.push(CompletionResponse::answer("Both failed."));
    let invoker = Arc::new(MemoryInvoker::default());
    let agent = controller(&model, &invoker, AgentConfig::default());

    let result = agent
        .run(
            AgentRequest {
                prompt: "Divide".into(),
                exchange: None,
                tools: vec![add_schema(), broken],
            },
            |_| true,
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    assert_eq!(result.tool_calls_made, 2);
    let results: Vec<&str> = result
        .exchange
        .turns
        .iter()
        .filter_map(|t| match t {
            Turn::ToolResult { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec!["Error: Div is broken", "Error: unknown tool: Demo__Nope"]);
    // Only the known tool reached the invoker
    assert_eq!(invoker.calls.lock().len(), 1);
}

#[tokio::test]
async fn test_iteration_budget_is_a_soft_stop() {
    let model = Arc::new(ScriptedCompletionService::new());
    model.repeat(
        CompletionResponse::answer("Checking again")
            .with_tool_calls(vec![call("loop", "Demo__Add", json!({"A": 1, "B": 1}))]),
    );
    let invoker = Arc::new(MemoryInvoker::default());
    let config = AgentConfig {
        max_iterations: 3,
        ..AgentConfig::default()
    };
    let agent = controller(&model, &invoker, config);

    let result = agent
        .run(
            AgentRequest {
                prompt: "Loop forever".into(),
                exchange: None,
                tools: vec![add_schema()],
            },
            |_| true,
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::IterationBudget);
    assert_eq!(result.iterations, 3);
    assert_eq!(model.calls(), 3);
    assert_eq!(result.tool_calls_made, 3);
    assert_eq!(result.final_response, "Checking again");
}

#[tokio::test]
async fn test_token_budget_is_a_soft_stop() {
    let model = Arc::new(ScriptedCompletionService::new());
    model.repeat(CompletionResponse {
        usage: Usage {
            prompt_tokens: 700,
            completion_tokens: 100,
            reasoning_tokens: 0,
            calls: 1,
        },
        ..CompletionResponse::answer("").with_tool_calls(vec![call("t", "Demo__Add", json!({}))])
    });
    let invoker = Arc::new(MemoryInvoker::default());
    let config = AgentConfig {
        max_total_tokens: Some(1500),
        ..AgentConfig::default()
    };
    let agent = controller(&model, &invoker, config);

    let result = agent
        .run(
            AgentRequest {
                prompt: "Spend tokens".into(),
                exchange: None,
                tools: vec![add_schema()],
            },
            |_| true,
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::TokenBudget);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.usage.total_tokens(), 1600);
}

/// Returning false from the observer stops the run where it is
#[tokio::test]
async fn test_observer_aborts_before_tool_runs() {
    let model = Arc::new(ScriptedCompletionService::new());
    model.push(
        CompletionResponse::answer("Let me add")
            .with_tool_calls(vec![call("c1", "Demo__Add", json!({"A": 1, "B": 2}))]),
    );
    let invoker = Arc::new(MemoryInvoker::default());
    let agent = controller(&model, &invoker, AgentConfig::default());

    let result = agent
        .run(
            AgentRequest {
                prompt: "Add".into(),
                exchange: None,
                tools: vec![add_schema()],
            },
            |event| !matches!(event, AgentEvent::ToolStarted { .. }),
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Aborted);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.tool_calls_made, 0);
    assert!(invoker.calls.lock().is_empty());
    assert_eq!(result.final_response, "Let me add");
}

#[tokio::test]
async fn test_aborting_a_stream() {
    let model = Arc::new(ScriptedCompletionService::from_answers(["never shown"]));
    let invoker = Arc::new(MemoryInvoker::default());
    let agent = controller(&model, &invoker, AgentConfig::default());

    let result = agent
        .run(
            AgentRequest {
                prompt: "Hi".into(),
                ..AgentRequest::default()
            },
            |event| !matches!(event, AgentEvent::Delta(_)),
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Aborted);
    assert_eq!(result.exchange.len(), 1);
}

#[tokio::test]
async fn test_continuing_an_exchange() {
    let mut exchange = ChatExchange::new();
    exchange.push_user("My name is Ada.");
    exchange.push_assistant("", "Hello Ada.", Vec::new());

    let model = Arc::new(ScriptedCompletionService::from_answers(["Ada."]));
    let invoker = Arc::new(MemoryInvoker::default());
    let agent = controller(
        &model,
        &invoker,
        AgentConfig {
            system_prompt: Some("Be brief.".into()),
            ..AgentConfig::default()
        },
    );

    let result = agent
        .run(
            AgentRequest {
                prompt: "What is my name?".into(),
                exchange: Some(exchange),
                tools: Vec::new(),
            },
            |_| true,
        )
        .await
        .unwrap();

    assert_eq!(result.exchange.len(), 4);
    let messages = &model.requests()[0].messages;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].content, "Be brief.");
    assert_eq!(messages[2].content, "Hello Ada.");
}

#[tokio::test]
async fn test_agent_drives_supervised_tools() {
    let dir = tempfile::tempdir().unwrap();
    let tree = UnitTree::new();
    let settings = SupervisorSettings {
        handshake_timeout: Duration::from_secs(10),
        ..SupervisorSettings::default()
    };
    let registry = MessageRegistry::new(Duration::from_secs(1));
    let ctx = HostContext::new(registry.clone(), Arc::new(CargoToolchain::new("/unused")))
    .with_settings(settings)
    .with_tree(&tree);
    let supervisor = Supervisor::start("Demo", dir.path().join("Demo"), ctx).await.unwrap();
    supervisor
        .use_binary(env!("CARGO_BIN_EXE_demo_tools"), vec![add_schema()])
        .await;
    tree.insert_root(supervisor.clone());

    let model = Arc::new(ScriptedCompletionService::new());
    model.push(
        CompletionResponse::answer("")
            .with_tool_calls(vec![call("c1", "Demo__Add", json!({"A": 20, "B": 22}))]),
    );
    model.push(CompletionResponse::answer("42"));
    let agent_job = registry.create("agent: add", CallFrame::new("agent", "", ActionKind::Agent));
    let agent = AgentController::new(
        model.clone(),
        Arc::new(SupervisorInvoker::new(tree.clone()).with_parent(agent_job)),
        AgentConfig::default(),
    );

    let result = agent
        .run(
            AgentRequest {
                prompt: "Add 20 and 22".into(),
                exchange: None,
                tools: supervisor.tools().await,
            },
            |_| true,
        )
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::Completed);
    let tool_message = model.requests()[1].messages.last().unwrap().clone();
    assert_eq!(tool_message.content, "42.0");

    // The tool call ran as a child of the agent job
    assert!(registry.stop(agent_job));
    let add = registry
        .snapshot()
        .into_iter()
        .find(|j| j.label == "Demo.Add")
        .unwrap();
    assert!(add.done);
    assert!(add.cancelled);

    supervisor.shutdown().await;
}
