//! Supervisor - compile, start, call and stop one unit's guest process
//!
//! # Locking
//!
//! Two `tokio::sync::Mutex`es, always taken in this order:
//!
//! 1. `process` - held for a whole start so at most one guest runs
//! 2. `unit`    - held for a whole compile so builds never overlap
//!
//! `compile` releases `unit` before a hot restart takes `process`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::handle::{ExitInfo, ProcessHandle, ProcessStatus};
use super::host::HostService;
use super::lifecycle::wait_for_registration;
use super::schema::{SchemaExtractor, ToolSchema};
use super::toolchain::{parse_diagnostics, CodeError, EntryModule, Toolchain};
use super::unit::{content_hash, source_files, CompiledUnit, ContentHash, UnitManifest, BIN_DIR};
use super::{HostContext, SupervisorError, SupervisorSettings};
use crate::metrics::Metrics;
use crate::registry::{ActionKind, CallFrame, JobId, JobOutcome, MessageRegistry};
use crate::wire::{
    BuildReply, BuildRequest, ChangeReply, ChangeRequest, Endpoint, GuestClient, HostEndpoint,
    RpcServer, UpdateReply, UpdateRequest,
};

/// Result of [`Supervisor::check_run`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    /// Guest port; 0 when the handshake timed out
    pub port: u16,
    /// A new process was launched by this call
    pub started: bool,
    /// Failed exit of the process this call replaced
    pub previous_exit: Option<ExitInfo>,
}

/// Result of [`Supervisor::compile`]
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub success: bool,
    /// Content hash of the sources as built, after the import fixer ran
    pub hash: String,
    pub errors: Vec<CodeError>,
    pub stderr: String,
    pub tools: Vec<ToolSchema>,
    /// A running guest was replaced by the new binary
    pub restarted: bool,
}

pub struct Supervisor {
    name: String,
    dir: PathBuf,
    settings: SupervisorSettings,
    toolchain: Arc<dyn Toolchain>,
    extractor: Arc<dyn SchemaExtractor>,
    registry: Arc<MessageRegistry>,
    metrics: Option<Arc<Metrics>>,
    process: Mutex<Option<ProcessHandle>>,
    unit: Mutex<CompiledUnit>,
    /// Written by the host service on `register`
    port: Arc<AtomicU16>,
    host_port: u16,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Open the unit at `dir` and start its host service
    pub async fn start(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        ctx: HostContext,
    ) -> Result<Arc<Self>, SupervisorError> {
        let name = name.into();
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let unit = CompiledUnit::open(&name, &dir);
        let port = Arc::new(AtomicU16::new(0));
        let shutdown = CancellationToken::new();

        let mut server = RpcServer::bind(
            ctx.settings.host,
            ctx.settings.port_base,
            ctx.settings.port_range,
        )
        .await?;
        if let Some(metrics) = &ctx.metrics {
            server = server.with_metrics(metrics.clone());
        }
        let service = HostService::new(name.clone(), port.clone(), ctx.clone());
        let host_port = server.spawn(Arc::new(HostEndpoint(Arc::new(service))), shutdown.clone());

        tracing::info!(
            unit = %name,
            dir = %dir.display(),
            host_port,
            has_binary = unit.binary.is_some(),
            "Supervisor started"
        );

        Ok(Arc::new(Self {
            name,
            dir,
            settings: ctx.settings,
            toolchain: ctx.toolchain,
            extractor: ctx.extractor,
            registry: ctx.registry,
            metrics: ctx.metrics,
            process: Mutex::new(None),
            unit: Mutex::new(unit),
            port,
            host_port,
            shutdown,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Port the guest registered, 0 when none has
    pub fn registered_port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    pub async fn tools(&self) -> Vec<ToolSchema> {
        self.unit.lock().await.tools.clone()
    }

    pub async fn compile_errors(&self) -> Vec<CodeError> {
        self.unit.lock().await.errors.clone()
    }

    pub async fn status(&self) -> ProcessStatus {
        match self.process.lock().await.as_ref() {
            Some(handle) => handle.status(),
            None => ProcessStatus::Stopped,
        }
    }

    /// Hash of the unit's current tool sources
    pub fn content_hash(&self) -> Result<ContentHash, SupervisorError> {
        Ok(content_hash(
            &self.dir,
            self.toolchain.source_extension(),
            self.toolchain.generated_files(),
        )?)
    }

    fn endpoint(&self, port: u16) -> Endpoint {
        Endpoint {
            host: self.settings.host,
            port,
            timeout: self.settings.call_timeout,
        }
    }

    /// Make sure a guest is running, starting one if needed
    pub async fn check_run(&self) -> Result<RunStatus, SupervisorError> {
        let mut slot = self.process.lock().await;
        if let Some(handle) = slot.as_ref() {
            if handle.is_alive() {
                return Ok(RunStatus {
                    port: self.registered_port(),
                    started: false,
                    previous_exit: None,
                });
            }
        }

        let previous_exit = slot
            .take()
            .and_then(|h| h.exit_info())
            .filter(ExitInfo::is_failure);
        if let Some(exit) = &previous_exit {
            tracing::warn!(unit = %self.name, status = %exit.summary(), "Previous guest failed");
        }

        let binary = {
            let unit = self.unit.lock().await;
            if unit.has_standing_error() {
                return Err(SupervisorError::CompileErrorStanding {
                    unit: self.name.clone(),
                    error: unit.compile_error.clone(),
                });
            }
            unit.binary
                .clone()
                .ok_or_else(|| SupervisorError::NoBinary(self.name.clone()))?
        };

        self.port.store(0, Ordering::Release);
        let mut handle = ProcessHandle::spawn(&self.name, &binary, self.host_port)
            .map_err(|source| SupervisorError::Spawn {
                binary: binary.clone(),
                source,
            })?;
        tracing::info!(unit = %self.name, pid = ?handle.pid, binary = %binary.display(), "Guest spawned");

        let timeout = self.settings.handshake_timeout;
        let registered = tokio::select! {
            port = wait_for_registration(&self.port, self.settings.handshake_poll, timeout) => port,
            _ = handle.wait_exit(timeout) => None,
        };

        let outcome = match registered {
            Some(port) => {
                handle.mark_registered();
                handle.mark_running();
                tracing::info!(unit = %self.name, port, "Guest registered");
                "registered"
            }
            None if handle.is_alive() => {
                tracing::warn!(unit = %self.name, ?timeout, "Guest did not register in time");
                "timeout"
            }
            None => {
                tracing::warn!(unit = %self.name, "Guest exited before registering");
                "exited"
            }
        };
        if let Some(m) = &self.metrics {
            m.process_starts.with_label_values(&[outcome]).inc();
        }

        *slot = Some(handle);
        Ok(RunStatus {
            port: registered.unwrap_or(0),
            started: true,
            previous_exit,
        })
    }

    /// Recompile when the sources moved or the binary is missing
    pub async fn compile_if_needed(&self) -> Result<Option<CompileOutcome>, SupervisorError> {
        let hash = self.content_hash()?;
        let stale = self.unit.lock().await.is_stale(&hash.hash);
        if !stale {
            return Ok(None);
        }
        self.compile(&hash).await.map(Some)
    }

    /// Build the unit's sources into `bin/<hash>`
    ///
    /// The import fixer may rewrite sources, so the binary and manifest are
    /// keyed by the hash taken after it ran; `content` is the caller's view
    /// before fixing. On failure the running guest, if any, keeps running on
    /// the old binary. Tracked as a registry job for its duration.
    pub async fn compile(&self, content: &ContentHash) -> Result<CompileOutcome, SupervisorError> {
        let short = content.hash.get(..12).unwrap_or(&content.hash).to_string();
        let frame = CallFrame::new(&self.name, "", ActionKind::Compile);
        let job = self.registry.create(format!("{}.compile", self.name), frame);
        let span = tracing::info_span!("compile", unit = %self.name, hash = %short, %job);
        let result = self.compile_and_restart(content).instrument(span).await;

        let outcome = match &result {
            Ok(outcome) if outcome.success => JobOutcome::default(),
            Ok(outcome) => JobOutcome::failed(format!("{} compile errors", outcome.errors.len())),
            Err(e) => JobOutcome::failed(e.to_string()),
        };
        self.registry.complete(job, outcome);
        result
    }

    async fn compile_and_restart(&self, content: &ContentHash) -> Result<CompileOutcome, SupervisorError> {
        let outcome = self.compile_locked(content).await?;
        let restarted = if outcome.success && self.is_running().await {
            self.restart().await?;
            true
        } else {
            false
        };
        Ok(CompileOutcome { restarted, ..outcome })
    }

    async fn compile_locked(&self, requested: &ContentHash) -> Result<CompileOutcome, SupervisorError> {
        let started = Instant::now();
        let mut unit = self.unit.lock().await;
        let ext = self.toolchain.source_extension();
        let files = source_files(&self.dir, ext, self.toolchain.generated_files())?;

        self.toolchain.fix_imports(&self.dir, &files).await;
        let content = self.content_hash()?;
        if content.hash != requested.hash {
            tracing::debug!(files = files.len(), "Import fixer rewrote sources");
        }

        let mut modules = Vec::with_capacity(files.len());
        let mut tools = Vec::new();
        for file in &files {
            let source = std::fs::read_to_string(self.dir.join(file))?;
            let surface = self.extractor.extract(&self.name, &source);
            modules.push(EntryModule {
                file: file.clone(),
                tools: surface.tools.iter().map(|t| t.name.clone()).collect(),
                has_init: surface.has_init,
                has_destroy: surface.has_destroy,
            });
            tools.extend(surface.tools);
        }
        tracing::debug!(files = files.len(), tools = tools.len(), "Tool surface discovered");

        self.toolchain.write_entry_point(&self.dir, &self.name, &modules)?;
        self.toolchain.ensure_metadata(&self.dir, &self.name)?;

        let output = unit.binary_path(&content.hash);
        let build = self.toolchain.build(&self.dir, &self.name, &output).await?;

        if let Some(m) = &self.metrics {
            let result = if build.success { "ok" } else { "error" };
            m.compiles.with_label_values(&[result]).inc();
            m.compile_duration.observe(started.elapsed().as_secs_f64());
        }

        unit.hash = content.hash.clone();
        if build.success {
            unit.compile_error.clear();
            unit.errors.clear();
            unit.binary = Some(output);
            unit.tools = tools.clone();
            let pruned = unit.prune_binaries(&content.hash);
            UnitManifest {
                hash: content.hash.clone(),
                binary: format!("{BIN_DIR}/{}", content.hash),
                tools: tools.clone(),
                files: content.files.clone(),
            }
            .save(&self.dir)?;
            tracing::info!(
                tools = tools.len(),
                pruned,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Compile succeeded"
            );
            Ok(CompileOutcome {
                success: true,
                hash: content.hash,
                errors: Vec::new(),
                stderr: build.stderr,
                tools,
                restarted: false,
            })
        } else {
            let errors = parse_diagnostics(&build.stderr);
            unit.compile_error = if errors.is_empty() {
                let text = build.stderr.trim();
                if text.is_empty() { "build failed".to_string() } else { text.to_string() }
            } else {
                errors
                    .iter()
                    .map(|e| format!("{}:{}:{}: {}", e.file, e.line, e.col, e.message))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            unit.errors = errors.clone();
            tracing::warn!(errors = errors.len(), "Compile failed");
            Ok(CompileOutcome {
                success: false,
                hash: content.hash,
                errors,
                stderr: build.stderr,
                tools: Vec::new(),
                restarted: false,
            })
        }
    }

    /// Run a prebuilt binary instead of compiling sources
    pub async fn use_binary(&self, binary: impl Into<PathBuf>, tools: Vec<ToolSchema>) {
        let mut unit = self.unit.lock().await;
        unit.binary = Some(binary.into());
        unit.compile_error.clear();
        unit.errors.clear();
        unit.tools = tools;
    }

    async fn is_running(&self) -> bool {
        self.process
            .lock()
            .await
            .as_ref()
            .is_some_and(ProcessHandle::is_alive)
    }

    /// Swap the running guest for one on the current binary
    async fn restart(&self) -> Result<RunStatus, SupervisorError> {
        tracing::info!(unit = %self.name, "Hot restart");
        self.stop().await;
        self.check_run().await
    }

    /// Graceful `exit`, then SIGTERM, then kill; each step waits `exit_timeout`
    pub async fn stop(&self) {
        let mut slot = self.process.lock().await;
        if let Some(mut handle) = slot.take() {
            self.shutdown_process(&mut handle).await;
        }
        self.port.store(0, Ordering::Release);
    }

    async fn shutdown_process(&self, handle: &mut ProcessHandle) {
        let wait = self.settings.exit_timeout;
        if handle.is_alive() {
            let port = self.registered_port();
            if port != 0 {
                let client = GuestClient::new(self.endpoint(port).with_timeout(wait));
                if let Err(e) = client.exit().await {
                    tracing::debug!(unit = %self.name, error = %e, "Exit RPC failed");
                }
            }
            if !handle.wait_exit(wait).await {
                tracing::warn!(unit = %self.name, "Guest ignored exit, sending SIGTERM");
                handle.terminate();
                if !handle.wait_exit(wait).await {
                    tracing::warn!(unit = %self.name, "Guest ignored SIGTERM, killing");
                    handle.kill();
                    handle.wait_exit(wait).await;
                }
            }
        }
        handle.mark_stopped();
        tracing::info!(unit = %self.name, uptime = ?handle.uptime(), "Guest stopped");
    }

    /// Call `tool` in the guest as a new job, nested under `parent` if given
    pub async fn invoke(
        &self,
        parent: Option<JobId>,
        tool: &str,
        params: Vec<u8>,
    ) -> Result<BuildReply, SupervisorError> {
        let label = format!("{}.{}", self.name, tool);
        let frame = CallFrame::new(&self.name, tool, ActionKind::Build);
        let job = match parent {
            Some(parent) => self.registry.create_child(parent, label, frame),
            None => self.registry.create(label, frame),
        };
        let span = tracing::info_span!("invoke", unit = %self.name, tool, %job);
        let result = self.build_in_guest(job, tool, params).instrument(span).await;

        let outcome = match &result {
            Ok(reply) => JobOutcome {
                data: reply.data.clone(),
                ui: reply.ui.clone(),
                error: reply.error.clone(),
            },
            Err(e) => JobOutcome::failed(e.to_string()),
        };
        self.registry.complete(job, outcome);
        result
    }

    async fn build_in_guest(
        &self,
        job: JobId,
        tool: &str,
        params: Vec<u8>,
    ) -> Result<BuildReply, SupervisorError> {
        let status = self.check_run().await?;
        let client = GuestClient::new(self.endpoint(status.port));
        let reply = client
            .build(&BuildRequest {
                job_id: job.0,
                ui_id: job.0,
                tool: tool.to_string(),
                params,
            })
            .await?;
        if !reply.cmds.is_empty() {
            self.registry.add_cmds(job, reply.cmds.clone());
        }
        if reply.is_error() {
            tracing::debug!(error = %reply.error, "Tool reported an error");
        }
        Ok(reply)
    }

    /// Forward a UI change to the tool instance built by job `ui`
    ///
    /// Runs as its own job nested under `ui`, so stopping either one reaches
    /// the guest's next progress check.
    pub async fn change(&self, ui: JobId, change: Vec<u8>) -> Result<ChangeReply, SupervisorError> {
        let job = self.ui_job(ui, ActionKind::Change);
        let span = tracing::info_span!("change", unit = %self.name, %ui, %job);
        let result = self.change_in_guest(job, ui, change).instrument(span).await;

        let outcome = match &result {
            Ok(reply) => JobOutcome {
                data: reply.data.clone(),
                ui: Vec::new(),
                error: reply.error.clone(),
            },
            Err(e) => JobOutcome::failed(e.to_string()),
        };
        self.registry.complete(job, outcome);
        result
    }

    async fn change_in_guest(&self, job: JobId, ui: JobId, change: Vec<u8>) -> Result<ChangeReply, SupervisorError> {
        let status = self.check_run().await?;
        let reply = GuestClient::new(self.endpoint(status.port))
            .change(&ChangeRequest {
                job_id: job.0,
                ui_id: ui.0,
                change,
            })
            .await?;
        if !reply.cmds.is_empty() {
            self.registry.add_cmds(job, reply.cmds.clone());
        }
        Ok(reply)
    }

    /// Ask the tool instance built by job `ui` to re-render `sub_id`
    pub async fn update(&self, ui: JobId, sub_id: u64) -> Result<UpdateReply, SupervisorError> {
        let job = self.ui_job(ui, ActionKind::Update);
        let span = tracing::info_span!("update", unit = %self.name, %ui, %job, sub_id);
        let result = self.update_in_guest(job, ui, sub_id).instrument(span).await;

        let outcome = match &result {
            Ok(reply) => JobOutcome {
                data: Vec::new(),
                ui: reply.ui.clone(),
                error: reply.error.clone(),
            },
            Err(e) => JobOutcome::failed(e.to_string()),
        };
        self.registry.complete(job, outcome);
        result
    }

    async fn update_in_guest(&self, job: JobId, ui: JobId, sub_id: u64) -> Result<UpdateReply, SupervisorError> {
        let status = self.check_run().await?;
        let reply = GuestClient::new(self.endpoint(status.port))
            .update(&UpdateRequest {
                job_id: job.0,
                ui_id: ui.0,
                sub_id,
            })
            .await?;
        if !reply.cmds.is_empty() {
            self.registry.add_cmds(job, reply.cmds.clone());
        }
        Ok(reply)
    }

    /// Child job of `ui` named after the tool that built it
    fn ui_job(&self, ui: JobId, action: ActionKind) -> JobId {
        let tool = self
            .registry
            .stack(ui)
            .into_iter()
            .next()
            .map_or_else(|| "ui".to_string(), |frame| frame.tool);
        let label = format!("{}.{tool}.{}", self.name, action.as_str());
        self.registry.create_child(ui, label, CallFrame::new(&self.name, &tool, action))
    }

    /// Stop the guest and the host service
    pub async fn shutdown(&self) {
        self.stop().await;
        self.shutdown.cancel();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("host_port", &self.host_port)
            .field("port", &self.registered_port())
            .finish()
    }
}
