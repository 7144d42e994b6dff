//! Process Supervisor - one compiled unit, at most one running guest
//!
//! # Architecture
//!
//! ```text
//!   UnitTree ──owns──► Arc<Supervisor> ──► CompiledUnit (sources, hash, bin/<hash>)
//!                          │
//!                          ├── ProcessHandle (guest child + watcher task)
//!                          └── RpcServer ◄──host verbs── guest
//!                                  │
//!                                  └── HostService ──► MessageRegistry / LLM / secrets
//! ```
//!
//! The guest is launched as `binary <host_port>`, dials back and sends
//! `register(port)`; from then on the supervisor drives it with guest verbs.

pub mod handle;
pub mod host;
pub mod lifecycle;
pub mod manager;
pub mod schema;
pub mod toolchain;
pub mod tree;
pub mod unit;

pub use handle::{ExitInfo, ProcessHandle, ProcessStatus};
pub use host::HostService;
pub use manager::{CompileOutcome, RunStatus, Supervisor};
pub use schema::{ConventionExtractor, OutputField, SchemaExtractor, SourceSurface, ToolSchema};
pub use toolchain::{parse_diagnostics, BuildOutput, CargoToolchain, CodeError, EntryModule, Toolchain};
pub use tree::{UnitId, UnitTree};
pub use unit::{content_hash, CompiledUnit, ContentHash, UnitManifest};

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;

use crate::codegen::SecretStore;
use crate::llm::CompletionService;
use crate::metrics::Metrics;
use crate::registry::MessageRegistry;
use crate::wire::RpcError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unit {unit} has a standing compile error: {error}")]
    CompileErrorStanding { unit: String, error: String },

    #[error("unit {0} has no binary; compile it first")]
    NoBinary(String),

    #[error("failed to spawn {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("toolchain failed: {0}")]
    Toolchain(String),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Timing and addressing shared by every supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Address host services bind and guests are dialled on
    pub host: IpAddr,
    /// First port tried for host services; 0 means ephemeral
    pub port_base: u16,
    pub port_range: u16,
    pub handshake_timeout: Duration,
    pub handshake_poll: Duration,
    /// Per step of the exit → SIGTERM → kill escalation
    pub exit_timeout: Duration,
    /// Bound on a single guest RPC; `None` waits for the tool to finish
    pub call_timeout: Option<Duration>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_base: 0,
            port_range: 100,
            handshake_timeout: Duration::from_secs(1),
            handshake_poll: Duration::from_millis(10),
            exit_timeout: Duration::from_secs(2),
            call_timeout: None,
        }
    }
}

/// Everything a supervisor and its host service reach for
#[derive(Clone)]
pub struct HostContext {
    pub registry: Arc<MessageRegistry>,
    pub toolchain: Arc<dyn Toolchain>,
    pub extractor: Arc<dyn SchemaExtractor>,
    pub completion: Option<Arc<dyn CompletionService>>,
    pub secrets: Arc<SecretStore>,
    /// Weak so supervisors owned by the tree do not keep it alive
    pub tree: Weak<UnitTree>,
    pub settings: SupervisorSettings,
    /// Filled into `llm_complete` requests that leave the model empty
    pub default_model: String,
    pub metrics: Option<Arc<Metrics>>,
}

impl HostContext {
    pub fn new(registry: Arc<MessageRegistry>, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            registry,
            toolchain,
            extractor: Arc::new(ConventionExtractor),
            completion: None,
            secrets: Arc::new(SecretStore::new()),
            tree: Weak::new(),
            settings: SupervisorSettings::default(),
            default_model: String::new(),
            metrics: None,
        }
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_completion(mut self, service: Arc<dyn CompletionService>, default_model: impl Into<String>) -> Self {
        self.completion = Some(service);
        self.default_model = default_model.into();
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_tree(mut self, tree: &Arc<UnitTree>) -> Self {
        self.tree = Arc::downgrade(tree);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
