//! Guest SDK - the runtime linked into every unit binary
//!
//! A unit's generated `main.rs` registers its tools on a [`ToolHost`] and
//! hands over control:
//!
//! ```text
//! binary <host_port>
//!     ├── bind an RPC server on an ephemeral port
//!     ├── register(port) → supervisor
//!     ├── serve build / change / update until `exit` or SIGTERM
//!     └── run destroy hooks
//! ```

mod context;

pub use context::ToolContext;

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::wire::{
    BuildReply, BuildRequest, ChangeReply, ChangeRequest, Endpoint, GuestEndpoint, GuestHandler, HostClient,
    RpcError, RpcServer, UpdateReply, UpdateRequest,
};

/// Live tool instances kept for `change`/`update`; oldest are evicted
const MAX_INSTANCES: usize = 256;

/// A tool: public fields are parameters, `Out_*` fields are outputs
pub trait Tool: Serialize + DeserializeOwned + Send + 'static {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String>;

    fn ui(&self) -> Vec<u8> {
        Vec::new()
    }

    fn change(&mut self, _ctx: &ToolContext, _change: &Value) -> Result<(), String> {
        Ok(())
    }

    fn update(&mut self, _ctx: &ToolContext, _sub_id: u64) -> Result<Vec<u8>, String> {
        Ok(Vec::new())
    }
}

/// Object-safe view of a [`Tool`]
trait DynTool: Send {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String>;
    fn data(&self) -> Result<Vec<u8>, String>;
    fn ui(&self) -> Vec<u8>;
    fn change(&mut self, ctx: &ToolContext, change: &Value) -> Result<(), String>;
    fn update(&mut self, ctx: &ToolContext, sub_id: u64) -> Result<Vec<u8>, String>;
}

impl<T: Tool> DynTool for T {
    fn run(&mut self, ctx: &ToolContext) -> Result<(), String> {
        Tool::run(self, ctx)
    }

    fn data(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("failed to serialize tool: {e}"))
    }

    fn ui(&self) -> Vec<u8> {
        Tool::ui(self)
    }

    fn change(&mut self, ctx: &ToolContext, change: &Value) -> Result<(), String> {
        Tool::change(self, ctx, change)
    }

    fn update(&mut self, ctx: &ToolContext, sub_id: u64) -> Result<Vec<u8>, String> {
        Tool::update(self, ctx, sub_id)
    }
}

type Factory = Box<dyn Fn(&[u8]) -> Result<Box<dyn DynTool>, String> + Send + Sync>;
type Instance = Arc<Mutex<(String, Box<dyn DynTool>)>>;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("usage: <binary> <host-port>")]
    Usage,

    #[error("failed to start guest runtime: {0}")]
    Io(#[from] std::io::Error),

    #[error("registration failed: {0}")]
    Register(#[from] RpcError),
}

/// Registry of a unit's tools plus its init/destroy hooks
pub struct ToolHost {
    unit: String,
    factories: HashMap<String, Factory>,
    init: Vec<fn()>,
    destroy: Vec<fn()>,
}

impl ToolHost {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            factories: HashMap::new(),
            init: Vec::new(),
            destroy: Vec::new(),
        }
    }

    pub fn register<T: Tool>(&mut self, name: &str) -> &mut Self {
        let factory: Factory = Box::new(|params: &[u8]| {
            let params: &[u8] = if params.is_empty() { b"{}" } else { params };
            serde_json::from_slice::<T>(params)
                .map(|tool| Box::new(tool) as Box<dyn DynTool>)
                .map_err(|e| format!("invalid parameters: {e}"))
        });
        self.factories.insert(name.to_string(), factory);
        self
    }

    pub fn on_init(&mut self, hook: fn()) -> &mut Self {
        self.init.push(hook);
        self
    }

    pub fn on_destroy(&mut self, hook: fn()) -> &mut Self {
        self.destroy.push(hook);
        self
    }

    /// Read the host port from the first argument and serve until told to exit
    pub fn run_from_args(self) -> ExitCode {
        let port = std::env::args().nth(1).and_then(|a| a.parse::<u16>().ok());
        let result = match port {
            Some(port) => self.run(Endpoint::localhost(port)),
            None => Err(GuestError::Usage),
        };
        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        }
    }

    pub fn run(self, host: Endpoint) -> Result<(), GuestError> {
        init_guest_logging();
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
        for hook in &self.init {
            hook();
        }
        let destroy = self.destroy.clone();
        let result = runtime.block_on(self.serve(host));
        for hook in &destroy {
            hook();
        }
        result
    }

    async fn serve(self, host: Endpoint) -> Result<(), GuestError> {
        let bind_host = if host.host.is_loopback() {
            host.host
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let server = RpcServer::bind(bind_host, 0, 1).await?;
        let shutdown = CancellationToken::new();
        let service = Arc::new(GuestService {
            unit: self.unit.clone(),
            factories: self.factories,
            instances: Mutex::new(BTreeMap::new()),
            client: HostClient::new(host),
            handle: Handle::current(),
            shutdown: shutdown.clone(),
        });

        let port = server.port();
        let serving = tokio::spawn(server.serve(Arc::new(GuestEndpoint(service)), shutdown.clone()));
        HostClient::new(host).register(port).await?;
        tracing::debug!(unit = %self.unit, port, "Registered with supervisor");

        wait_for_exit(&shutdown).await;
        shutdown.cancel();
        let _ = serving.await;
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_exit(shutdown: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = term.recv() => tracing::debug!("SIGTERM received"),
            }
        }
        Err(_) => shutdown.cancelled().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_exit(shutdown: &CancellationToken) {
    shutdown.cancelled().await;
}

/// Guest logs go to stderr, which the supervisor captures
fn init_guest_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("TOOLSMITH_GUEST_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

struct GuestService {
    unit: String,
    factories: HashMap<String, Factory>,
    instances: Mutex<BTreeMap<u64, Instance>>,
    client: HostClient,
    handle: Handle,
    shutdown: CancellationToken,
}

impl GuestService {
    fn context(&self, job_id: u64, tool: &str) -> ToolContext {
        ToolContext::new(job_id, tool, self.client, self.handle.clone())
    }

    fn keep(&self, ui_id: u64, instance: Instance) {
        let mut instances = self.instances.lock();
        instances.insert(ui_id, instance);
        while instances.len() > MAX_INSTANCES {
            instances.pop_first();
        }
    }

    fn instance(&self, ui_id: u64) -> Option<Instance> {
        self.instances.lock().get(&ui_id).cloned()
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    if e.is_panic() {
        "tool panicked".to_string()
    } else {
        "tool was cancelled".to_string()
    }
}

#[async_trait]
impl GuestHandler for GuestService {
    async fn build(&self, request: BuildRequest) -> BuildReply {
        let Some(factory) = self.factories.get(&request.tool) else {
            return BuildReply::error(format!("unknown tool: {}", request.tool));
        };
        let tool = match factory(&request.params) {
            Ok(tool) => tool,
            Err(e) => return BuildReply::error(e),
        };
        let instance: Instance = Arc::new(Mutex::new((request.tool.clone(), tool)));
        let ctx = self.context(request.job_id, &request.tool);

        let running = instance.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = running.lock();
            let tool = &mut guard.1;
            let result = tool.run(&ctx).and_then(|()| tool.data());
            (result, tool.ui(), ctx.take_cmds())
        })
        .await;

        match outcome {
            Ok((Ok(data), ui, cmds)) => {
                self.keep(request.ui_id, instance);
                BuildReply {
                    error: String::new(),
                    data,
                    ui,
                    cmds,
                }
            }
            Ok((Err(error), _, cmds)) => BuildReply {
                error,
                cmds,
                ..BuildReply::default()
            },
            Err(e) => {
                tracing::error!(unit = %self.unit, tool = %request.tool, "{}", panic_message(e));
                BuildReply::error("tool panicked")
            }
        }
    }

    async fn change(&self, request: ChangeRequest) -> ChangeReply {
        let Some(instance) = self.instance(request.ui_id) else {
            return ChangeReply {
                error: format!("no live tool for ui {}", request.ui_id),
                ..ChangeReply::default()
            };
        };
        let change: Value = match serde_json::from_slice(&request.change) {
            Ok(v) => v,
            Err(e) => {
                return ChangeReply {
                    error: format!("invalid change: {e}"),
                    ..ChangeReply::default()
                }
            }
        };
        let client = self.client;
        let handle = self.handle.clone();
        let job_id = request.job_id;
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = instance.lock();
            let (name, tool) = &mut *guard;
            let ctx = ToolContext::new(job_id, name.as_str(), client, handle);
            let result = tool.change(&ctx, &change).and_then(|()| tool.data());
            (result, ctx.take_cmds())
        })
        .await;

        match outcome {
            Ok((Ok(data), cmds)) => ChangeReply {
                error: String::new(),
                data,
                cmds,
            },
            Ok((Err(error), cmds)) => ChangeReply {
                error,
                data: Vec::new(),
                cmds,
            },
            Err(e) => ChangeReply {
                error: panic_message(e),
                ..ChangeReply::default()
            },
        }
    }

    async fn update(&self, request: UpdateRequest) -> UpdateReply {
        let Some(instance) = self.instance(request.ui_id) else {
            return UpdateReply {
                error: format!("no live tool for ui {}", request.ui_id),
                ..UpdateReply::default()
            };
        };
        let client = self.client;
        let handle = self.handle.clone();
        let UpdateRequest { job_id, sub_id, .. } = request;
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = instance.lock();
            let (name, tool) = &mut *guard;
            let ctx = ToolContext::new(job_id, name.as_str(), client, handle);
            let result = tool.update(&ctx, sub_id);
            (result, ctx.take_cmds())
        })
        .await;

        match outcome {
            Ok((Ok(ui), cmds)) => UpdateReply {
                error: String::new(),
                ui,
                cmds,
            },
            Ok((Err(error), cmds)) => UpdateReply {
                error,
                ui: Vec::new(),
                cmds,
            },
            Err(e) => UpdateReply {
                error: panic_message(e),
                ..UpdateReply::default()
            },
        }
    }

    async fn exit(&self) {
        tracing::debug!(unit = %self.unit, "Exit requested");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    #[allow(non_snake_case)]
    struct Double {
        X: i64,
        Out_Y: i64,
    }

    impl Tool for Double {
        fn run(&mut self, _ctx: &ToolContext) -> Result<(), String> {
            self.Out_Y = self.X * 2;
            Ok(())
        }
    }

    fn service() -> GuestService {
        let mut host = ToolHost::new("Math");
        host.register::<Double>("Double");
        GuestService {
            unit: host.unit,
            factories: host.factories,
            instances: Mutex::new(BTreeMap::new()),
            client: HostClient::new(Endpoint::localhost(0)),
            handle: Handle::current(),
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_build_runs_tool_and_keeps_instance() {
        let service = service();
        let reply = service
            .build(BuildRequest {
                job_id: 1,
                ui_id: 7,
                tool: "Double".into(),
                params: br#"{"X":21}"#.to_vec(),
            })
            .await;
        assert!(!reply.is_error(), "{}", reply.error);
        let data: Value = serde_json::from_slice(&reply.data).unwrap();
        assert_eq!(data["Out_Y"], 42);
        assert!(service.instance(7).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_tool_and_bad_params() {
        let service = service();
        let reply = service
            .build(BuildRequest {
                job_id: 1,
                ui_id: 1,
                tool: "Triple".into(),
                params: Vec::new(),
            })
            .await;
        assert_eq!(reply.error, "unknown tool: Triple");

        let reply = service
            .build(BuildRequest {
                job_id: 1,
                ui_id: 1,
                tool: "Double".into(),
                params: br#"{"X":"nope"}"#.to_vec(),
            })
            .await;
        assert!(reply.error.starts_with("invalid parameters"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_change_without_instance_fails() {
        let service = service();
        let reply = service
            .change(ChangeRequest {
                job_id: 1,
                ui_id: 3,
                change: b"{}".to_vec(),
            })
            .await;
        assert_eq!(reply.error, "no live tool for ui 3");
    }

    #[tokio::test]
    async fn test_exit_cancels() {
        let service = service();
        service.exit().await;
        assert!(service.shutdown.is_cancelled());
    }
}
