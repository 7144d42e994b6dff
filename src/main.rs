//! toolsmith CLI
//!
//! ```text
//! toolsmith generate prompts.md --unit Notes     author + compile a unit
//! toolsmith run Notes Add --params '{"A":1}'      invoke one tool
//! toolsmith agent "sum 1 and 2" --unit Notes      agentic loop over unit tools
//! toolsmith sessions                              list saved agent sessions
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use toolsmith::agent::{AgentEvent, AgentRequest, Session, StopReason};
use toolsmith::codegen::{parse_prompt_file, GenState};
use toolsmith::config::Config;
use toolsmith::llm::StreamDelta;
use toolsmith::registry::JobOutcome;
use toolsmith::services::Services;
use toolsmith::supervisor::ToolSchema;

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "toolsmith", version)]
#[command(about = "LLM-authored tools, compiled and run as supervised subprocesses")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a unit's tools from a prompt file (`# ToolName` sections)
    Generate {
        prompts: PathBuf,
        #[arg(short, long)]
        unit: String,
    },
    /// Invoke one tool of a unit
    Run {
        unit: String,
        tool: String,
        #[arg(short, long, default_value = "{}")]
        params: String,
    },
    /// Let the model answer a task using the tools of the given units
    Agent {
        task: String,
        #[arg(short, long = "unit", required = true)]
        units: Vec<String>,
        /// Continue a saved session
        #[arg(long)]
        session: Option<String>,
    },
    /// List saved agent sessions
    Sessions {
        #[arg(long)]
        delete: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = toolsmith::tracing::init_tracing("toolsmith", &config.logging) {
        eprintln!("warning: tracing disabled: {e}");
    }

    let services = match Services::new(config) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Generate { prompts, unit } => generate(&services, &prompts, &unit).await,
        Command::Run { unit, tool, params } => run(&services, &unit, &tool, &params).await,
        Command::Agent { task, units, session } => agent(&services, task, &units, session).await,
        Command::Sessions { delete } => sessions(&services, delete),
    };

    services.shutdown().await;
    toolsmith::tracing::shutdown_tracing();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Cancelled on Ctrl-C
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

async fn generate(services: &Services, prompts: &Path, unit: &str) -> CliResult {
    let text = std::fs::read_to_string(prompts)?;
    let mut specs = parse_prompt_file(&text);
    if specs.is_empty() {
        return Err(format!("{} has no `# ToolName` sections", prompts.display()).into());
    }

    let supervisor = services.open_unit(unit).await?;
    let generator = services.generator(supervisor)?;
    let loaded = generator.load_existing(&mut specs);
    if loaded > 0 {
        println!("Reusing {loaded} existing source file(s)");
    }

    let report = generator.run(&mut specs, &interrupt_token()).await?;
    println!(
        "Unit {unit} compiled after {} attempt(s), {} tokens",
        report.attempts,
        report.usage.total_tokens()
    );
    for spec in specs.iter().filter(|s| s.state == GenState::Done) {
        println!("  {} ({} tool(s))", spec.name, spec.tools.len());
    }
    print_tools(&report.tools);
    Ok(())
}

async fn run(services: &Services, unit: &str, tool: &str, params: &str) -> CliResult {
    let params: serde_json::Value = serde_json::from_str(params)?;
    let supervisor = services.open_unit(unit).await?;
    if let Some(outcome) = supervisor.compile_if_needed().await? {
        if !outcome.success {
            for e in &outcome.errors {
                eprintln!("{}:{}:{}: {}", e.file, e.line, e.col, e.message);
            }
            return Err(format!("unit {unit} does not compile").into());
        }
    }

    let reply = supervisor.invoke(None, tool, serde_json::to_vec(&params)?).await?;
    if reply.is_error() {
        return Err(reply.error.into());
    }
    let data: serde_json::Value = serde_json::from_slice(&reply.data)?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    if !reply.ui.is_empty() {
        println!("ui: {}", String::from_utf8_lossy(&reply.ui));
    }
    Ok(())
}

async fn agent(services: &Services, task: String, units: &[String], session_id: Option<String>) -> CliResult {
    let mut tools: Vec<ToolSchema> = Vec::new();
    for unit in units {
        let supervisor = services.open_unit(unit).await?;
        if let Some(outcome) = supervisor.compile_if_needed().await? {
            if !outcome.success {
                return Err(format!("unit {unit} does not compile").into());
            }
        }
        tools.extend(supervisor.tools().await);
    }

    let store = services.session_store()?;
    let (controller, job) = services.agent(&task)?;
    let mut session = match session_id {
        Some(id) => store.load(&id)?,
        None => Session::new(task.clone(), controller.config().model.clone()),
    };
    session.units = units.to_vec();

    let request = AgentRequest {
        prompt: task,
        exchange: Some(session.exchange.clone()),
        tools,
    };

    let cancel = interrupt_token();
    let interrupted = Arc::new(AtomicBool::new(false));
    let watcher = {
        let interrupted = interrupted.clone();
        let cancel = cancel.clone();
        let registry = services.registry.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            interrupted.store(true, Ordering::Release);
            registry.stop(job);
        })
    };

    let result = controller
        .run(request, |event| {
            match event {
                AgentEvent::Delta(StreamDelta::Text(text)) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolStarted { name, .. } => eprintln!("\n→ {name}"),
                AgentEvent::ToolFinished { name, summary, failed, .. } => {
                    let mark = if failed { "✗" } else { "✓" };
                    eprintln!("{mark} {name}: {summary}");
                }
                _ => {}
            }
            !interrupted.load(Ordering::Acquire)
        })
        .await;
    watcher.abort();
    services.registry.complete(
        job,
        match &result {
            Ok(r) => JobOutcome {
                data: r.final_response.clone().into_bytes(),
                ..JobOutcome::default()
            },
            Err(e) => JobOutcome::failed(e.to_string()),
        },
    );
    let result = result?;
    println!();

    session.record_run(
        result.exchange.clone(),
        result.iterations,
        &result.usage,
        result.stop_reason == StopReason::Completed,
    );
    store.save(&session)?;
    eprintln!(
        "[{:?}] {} iteration(s), {} tool call(s), {} tokens, session {}",
        result.stop_reason,
        result.iterations,
        result.tool_calls_made,
        result.usage.total_tokens(),
        session.id
    );
    Ok(())
}

fn sessions(services: &Services, delete: Option<String>) -> CliResult {
    let store = services.session_store()?;
    if let Some(id) = delete {
        store.delete(&id)?;
        println!("Deleted {id}");
        return Ok(());
    }
    for s in store.list()? {
        let state = if s.complete { "done" } else { "open" };
        println!(
            "{}  {}  {:>3} it  {:>7} tok  {state}  {}",
            s.id, s.created_at, s.iterations, s.tokens, s.task
        );
    }
    Ok(())
}

fn print_tools(tools: &[ToolSchema]) {
    for tool in tools {
        let outputs: Vec<&str> = tool.outputs.iter().map(|o| o.name.as_str()).collect();
        println!("    {}.{} -> [{}]", tool.unit, tool.name, outputs.join(", "));
    }
}
