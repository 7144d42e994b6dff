//! Process-wide services, built once at startup
//!
//! Holds the shared collaborators every command needs and wires them into
//! supervisors, generators and agents. Nothing here is global state: tests
//! build their own [`Services`] with a scripted completion service or a fake
//! toolchain.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentController, SessionStore, SupervisorInvoker};
use crate::codegen::{CodeGenerator, SecretStore, SecretsError};
use crate::config::{Config, LlmProvider};
use crate::llm::{CompletionService, OllamaService};
use crate::metrics::Metrics;
use crate::registry::{ActionKind, CallFrame, JobId, MessageRegistry};
use crate::supervisor::{CargoToolchain, HostContext, Supervisor, SupervisorError, Toolchain, UnitTree};

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error("failed to create metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("no completion service configured (llm.provider = \"none\")")]
    NoCompletion,

    #[error("session store unavailable: {0}")]
    Sessions(#[from] std::io::Error),
}

pub struct Services {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<MessageRegistry>,
    pub tree: Arc<UnitTree>,
    pub secrets: Arc<SecretStore>,
    pub completion: Option<Arc<dyn CompletionService>>,
    pub toolchain: Arc<dyn Toolchain>,
    shutdown: CancellationToken,
}

impl Services {
    /// Build everything `config` describes and start the maintenance tasks
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self, ServicesError> {
        let metrics = Arc::new(Metrics::new()?);
        let registry = MessageRegistry::with_metrics(
            Duration::from_millis(config.registry.slow_threshold_ms),
            metrics.clone(),
        );

        let secrets = Arc::new(match &config.secrets.file {
            Some(path) => SecretStore::from_file(path)?,
            None => SecretStore::new(),
        });

        let completion: Option<Arc<dyn CompletionService>> = match config.llm.provider {
            LlmProvider::Ollama => Some(Arc::new(OllamaService::new(config.llm.base_url.clone()))),
            LlmProvider::None => None,
        };

        let mut toolchain = CargoToolchain::new(config.supervisor.sdk_path.clone());
        if let Some(target) = &config.supervisor.target_dir {
            toolchain = toolchain.with_target_dir(target);
        }

        let services = Self {
            metrics,
            registry,
            tree: UnitTree::new(),
            secrets,
            completion,
            toolchain: Arc::new(toolchain),
            shutdown: CancellationToken::new(),
            config,
        };
        services.spawn_maintenance();
        Ok(services)
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = toolchain;
        self
    }

    fn spawn_maintenance(&self) {
        self.registry.spawn_flusher(
            Duration::from_millis(self.config.registry.flush_interval_ms),
            self.shutdown.child_token(),
        );
        if self.config.secrets.file.is_some() && self.config.secrets.refresh_secs > 0 {
            self.secrets.spawn_refresh(
                Duration::from_secs(self.config.secrets.refresh_secs),
                self.shutdown.child_token(),
            );
        }
    }

    pub fn host_context(&self) -> HostContext {
        let mut ctx = HostContext::new(self.registry.clone(), self.toolchain.clone())
            .with_settings(self.config.supervisor_settings())
            .with_secrets(self.secrets.clone())
            .with_tree(&self.tree)
            .with_metrics(self.metrics.clone());
        if let Some(completion) = &self.completion {
            ctx = ctx.with_completion(completion.clone(), self.config.llm.default_model.clone());
        }
        ctx
    }

    /// Supervisor for `name`, started and added to the tree on first use
    pub async fn open_unit(&self, name: &str) -> Result<Arc<Supervisor>, ServicesError> {
        if let Some(existing) = self.tree.find(name) {
            return Ok(existing);
        }
        let dir = self.config.supervisor.units_dir.join(name);
        let supervisor = Supervisor::start(name, dir, self.host_context()).await?;
        self.tree.insert_root(supervisor.clone());
        Ok(supervisor)
    }

    pub fn completion(&self) -> Result<Arc<dyn CompletionService>, ServicesError> {
        self.completion.clone().ok_or(ServicesError::NoCompletion)
    }

    pub fn generator(&self, supervisor: Arc<Supervisor>) -> Result<CodeGenerator, ServicesError> {
        Ok(CodeGenerator::new(self.completion()?, supervisor, self.config.generator_settings())
            .with_secrets(self.secrets.clone())
            .with_metrics(self.metrics.clone()))
    }

    /// Controller for `task` whose tool calls nest under a new Agent job
    ///
    /// Stopping the returned job stops every tool call it made; the caller
    /// completes it when the run ends.
    pub fn agent(&self, task: &str) -> Result<(AgentController, JobId), ServicesError> {
        let completion = self.completion()?;
        let label: String = task.chars().take(40).collect();
        let job = self
            .registry
            .create(format!("agent: {label}"), CallFrame::new("agent", "", ActionKind::Agent));
        let invoker = Arc::new(SupervisorInvoker::new(self.tree.clone()).with_parent(job));
        let controller = AgentController::new(completion, invoker, self.config.agent_config())
            .with_metrics(self.metrics.clone());
        Ok((controller, job))
    }

    pub fn session_store(&self) -> Result<SessionStore, ServicesError> {
        Ok(match &self.config.agent.sessions_dir {
            Some(dir) => SessionStore::new(dir)?,
            None => SessionStore::default_store()?,
        })
    }

    /// Stop every guest and the maintenance tasks
    pub async fn shutdown(&self) {
        for supervisor in self.tree.all() {
            supervisor.shutdown().await;
        }
        self.shutdown.cancel();
        tracing::info!(report = ?self.registry.flush(), "Services stopped");
    }
}
