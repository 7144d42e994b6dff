//! Typed verbs of the private wire protocol
//!
//! Every exchange starts with a verb (a UTF-8 array frame) followed by the
//! verb's fields in a fixed order. Two directions exist:
//!
//! ```text
//! guest ──HostVerb──►  supervisor     register, print, progress, add_cmds, ...
//! supervisor ──GuestVerb──► guest     build, change, update, exit
//! ```
//!
//! Each side implements a handler trait with one method per verb. The
//! `dispatch_*` functions hold the only `match` over the verb tag, so adding
//! a verb without a handler (or a handler without codec) does not compile.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::frame::{FrameConn, FrameError};

/// Verbs a guest sends to its supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostVerb {
    Register,
    Print,
    Progress,
    AddCmds,
    GetMsgs,
    StopMsg,
    LlmComplete,
    CallTool,
    Secret,
    SandboxViolation,
}

impl HostVerb {
    pub const ALL: [HostVerb; 10] = [
        HostVerb::Register,
        HostVerb::Print,
        HostVerb::Progress,
        HostVerb::AddCmds,
        HostVerb::GetMsgs,
        HostVerb::StopMsg,
        HostVerb::LlmComplete,
        HostVerb::CallTool,
        HostVerb::Secret,
        HostVerb::SandboxViolation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HostVerb::Register => "register",
            HostVerb::Print => "print",
            HostVerb::Progress => "progress",
            HostVerb::AddCmds => "add_cmds",
            HostVerb::GetMsgs => "get_msgs",
            HostVerb::StopMsg => "stop_msg",
            HostVerb::LlmComplete => "llm_complete",
            HostVerb::CallTool => "call_tool",
            HostVerb::Secret => "secret",
            HostVerb::SandboxViolation => "sandbox_violation",
        }
    }

    pub fn parse(verb: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == verb)
    }
}

/// Verbs a supervisor sends to a guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestVerb {
    Build,
    Change,
    Update,
    Exit,
}

impl GuestVerb {
    pub const ALL: [GuestVerb; 4] = [
        GuestVerb::Build,
        GuestVerb::Change,
        GuestVerb::Update,
        GuestVerb::Exit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GuestVerb::Build => "build",
            GuestVerb::Change => "change",
            GuestVerb::Update => "update",
            GuestVerb::Exit => "exit",
        }
    }

    pub fn parse(verb: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == verb)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request bodies (fields after the verb)
// ─────────────────────────────────────────────────────────────────────────────

/// `build(jobId, uiId, toolName, paramsJSON)`
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub job_id: u64,
    pub ui_id: u64,
    pub tool: String,
    pub params: Vec<u8>,
}

impl BuildRequest {
    async fn write<S>(&self, conn: &mut FrameConn<S>) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_int(self.job_id).await?;
        conn.write_int(self.ui_id).await?;
        conn.write_str(&self.tool).await?;
        conn.write_array(&self.params).await
    }

    async fn read<S>(conn: &mut FrameConn<S>) -> Result<Self, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Ok(Self {
            job_id: conn.read_int().await?,
            ui_id: conn.read_int().await?,
            tool: conn.read_string().await?,
            params: conn.read_array().await?,
        })
    }
}

/// `change(jobId, uiId, changeJSON)`
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequest {
    pub job_id: u64,
    pub ui_id: u64,
    pub change: Vec<u8>,
}

/// `update(jobId, uiId, subId)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateRequest {
    pub job_id: u64,
    pub ui_id: u64,
    pub sub_id: u64,
}

/// `progress(jobId, doneFraction, label)`
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRequest {
    pub job_id: u64,
    pub done: f64,
    pub label: String,
}

/// `call_tool(jobId, unit, tool, paramsJSON)`
#[derive(Debug, Clone, PartialEq)]
pub struct CallToolRequest {
    pub job_id: u64,
    pub unit: String,
    pub tool: String,
    pub params: Vec<u8>,
}

/// `sandbox_violation(jobId, kind, detail)`
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationRequest {
    pub job_id: u64,
    pub kind: String,
    pub detail: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Replies
// ─────────────────────────────────────────────────────────────────────────────

/// Reply to `build` and `call_tool`: `(error, data, ui, cmds)`
///
/// An empty error string means success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReply {
    pub error: String,
    pub data: Vec<u8>,
    pub ui: Vec<u8>,
    pub cmds: Vec<u8>,
}

impl BuildReply {
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    async fn write<S>(&self, conn: &mut FrameConn<S>) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(&self.error).await?;
        conn.write_array(&self.data).await?;
        conn.write_array(&self.ui).await?;
        conn.write_array(&self.cmds).await
    }

    async fn read<S>(conn: &mut FrameConn<S>) -> Result<Self, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Ok(Self {
            error: conn.read_string().await?,
            data: conn.read_array().await?,
            ui: conn.read_array().await?,
            cmds: conn.read_array().await?,
        })
    }
}

/// Reply to `change`: `(error, data, cmds)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeReply {
    pub error: String,
    pub data: Vec<u8>,
    pub cmds: Vec<u8>,
}

/// Reply to `update`: `(error, ui, cmds)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReply {
    pub error: String,
    pub ui: Vec<u8>,
    pub cmds: Vec<u8>,
}

/// Reply to `llm_complete`: `(error, responseJSON)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionReply {
    pub error: String,
    pub response: Vec<u8>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers and dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Supervisor side: one method per [`HostVerb`]
#[async_trait]
pub trait HostHandler: Send + Sync + 'static {
    async fn register(&self, port: u16);
    async fn print(&self, source: String, text: String);
    /// Returns `true` when the job was cancelled
    async fn progress(&self, request: ProgressRequest) -> bool;
    async fn add_cmds(&self, job_id: u64, cmds: Vec<u8>);
    /// Serialized job snapshot; an error drops the connection unanswered
    async fn get_msgs(&self) -> Result<Vec<u8>, String>;
    async fn stop_msg(&self, job_id: u64);
    async fn llm_complete(&self, job_id: u64, request: Vec<u8>) -> CompletionReply;
    async fn call_tool(&self, request: CallToolRequest) -> BuildReply;
    async fn secret(&self, alias: String) -> String;
    /// Returns `true` when the guest must block the offending operation
    async fn sandbox_violation(&self, request: ViolationRequest) -> bool;
}

/// Guest side: one method per [`GuestVerb`]
#[async_trait]
pub trait GuestHandler: Send + Sync + 'static {
    async fn build(&self, request: BuildRequest) -> BuildReply;
    async fn change(&self, request: ChangeRequest) -> ChangeReply;
    async fn update(&self, request: UpdateRequest) -> UpdateReply;
    async fn exit(&self);
}

/// Result of serving one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Verb(&'static str),
    Unknown,
}

/// Read one host verb and its fields, run the handler, write the reply
pub async fn dispatch_host<H, S>(handler: &H, conn: &mut FrameConn<S>) -> Result<Served, FrameError>
where
    H: HostHandler + ?Sized,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let verb = conn.read_string().await?;
    let Some(verb) = HostVerb::parse(&verb) else {
        tracing::warn!(verb = %verb, "Unknown host verb");
        return Ok(Served::Unknown);
    };

    match verb {
        HostVerb::Register => {
            let port = conn.read_int().await?;
            match u16::try_from(port) {
                Ok(port) => handler.register(port).await,
                Err(_) => tracing::warn!(port, "Ignoring register with out-of-range port"),
            }
        }
        HostVerb::Print => {
            let source = conn.read_string().await?;
            let text = conn.read_string().await?;
            handler.print(source, text).await;
        }
        HostVerb::Progress => {
            let request = ProgressRequest {
                job_id: conn.read_int().await?,
                done: conn.read_f64().await?,
                label: conn.read_string().await?,
            };
            let cancelled = handler.progress(request).await;
            conn.write_bool(cancelled).await?;
        }
        HostVerb::AddCmds => {
            let job_id = conn.read_int().await?;
            let cmds = conn.read_array().await?;
            handler.add_cmds(job_id, cmds).await;
        }
        HostVerb::GetMsgs => {
            let msgs = handler.get_msgs().await.map_err(FrameError::Handler)?;
            conn.write_array(&msgs).await?;
        }
        HostVerb::StopMsg => {
            let job_id = conn.read_int().await?;
            handler.stop_msg(job_id).await;
        }
        HostVerb::LlmComplete => {
            let job_id = conn.read_int().await?;
            let request = conn.read_array().await?;
            let reply = handler.llm_complete(job_id, request).await;
            conn.write_str(&reply.error).await?;
            conn.write_array(&reply.response).await?;
        }
        HostVerb::CallTool => {
            let request = CallToolRequest {
                job_id: conn.read_int().await?,
                unit: conn.read_string().await?,
                tool: conn.read_string().await?,
                params: conn.read_array().await?,
            };
            let reply = handler.call_tool(request).await;
            reply.write(conn).await?;
        }
        HostVerb::Secret => {
            let alias = conn.read_string().await?;
            let value = handler.secret(alias).await;
            conn.write_str(&value).await?;
        }
        HostVerb::SandboxViolation => {
            let request = ViolationRequest {
                job_id: conn.read_int().await?,
                kind: conn.read_string().await?,
                detail: conn.read_string().await?,
            };
            let block = handler.sandbox_violation(request).await;
            conn.write_bool(block).await?;
        }
    }

    conn.flush().await?;
    Ok(Served::Verb(verb.as_str()))
}

/// Read one guest verb and its fields, run the handler, write the reply
pub async fn dispatch_guest<G, S>(handler: &G, conn: &mut FrameConn<S>) -> Result<Served, FrameError>
where
    G: GuestHandler + ?Sized,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let verb = conn.read_string().await?;
    let Some(verb) = GuestVerb::parse(&verb) else {
        tracing::warn!(verb = %verb, "Unknown guest verb");
        return Ok(Served::Unknown);
    };

    match verb {
        GuestVerb::Build => {
            let request = BuildRequest::read(conn).await?;
            let reply = handler.build(request).await;
            reply.write(conn).await?;
        }
        GuestVerb::Change => {
            let request = ChangeRequest {
                job_id: conn.read_int().await?,
                ui_id: conn.read_int().await?,
                change: conn.read_array().await?,
            };
            let reply = handler.change(request).await;
            conn.write_str(&reply.error).await?;
            conn.write_array(&reply.data).await?;
            conn.write_array(&reply.cmds).await?;
        }
        GuestVerb::Update => {
            let request = UpdateRequest {
                job_id: conn.read_int().await?,
                ui_id: conn.read_int().await?,
                sub_id: conn.read_int().await?,
            };
            let reply = handler.update(request).await;
            conn.write_str(&reply.error).await?;
            conn.write_array(&reply.ui).await?;
            conn.write_array(&reply.cmds).await?;
        }
        GuestVerb::Exit => handler.exit().await,
    }

    conn.flush().await?;
    Ok(Served::Verb(verb.as_str()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Client-side encoders (same field order as the dispatchers above)
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) mod encode {
    use super::*;

    pub async fn build<S>(conn: &mut FrameConn<S>, request: &BuildRequest) -> Result<BuildReply, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(GuestVerb::Build.as_str()).await?;
        request.write(conn).await?;
        conn.flush().await?;
        BuildReply::read(conn).await
    }

    pub async fn change<S>(conn: &mut FrameConn<S>, request: &ChangeRequest) -> Result<ChangeReply, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(GuestVerb::Change.as_str()).await?;
        conn.write_int(request.job_id).await?;
        conn.write_int(request.ui_id).await?;
        conn.write_array(&request.change).await?;
        conn.flush().await?;
        Ok(ChangeReply {
            error: conn.read_string().await?,
            data: conn.read_array().await?,
            cmds: conn.read_array().await?,
        })
    }

    pub async fn update<S>(conn: &mut FrameConn<S>, request: &UpdateRequest) -> Result<UpdateReply, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(GuestVerb::Update.as_str()).await?;
        conn.write_int(request.job_id).await?;
        conn.write_int(request.ui_id).await?;
        conn.write_int(request.sub_id).await?;
        conn.flush().await?;
        Ok(UpdateReply {
            error: conn.read_string().await?,
            ui: conn.read_array().await?,
            cmds: conn.read_array().await?,
        })
    }

    pub async fn exit<S>(conn: &mut FrameConn<S>) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(GuestVerb::Exit.as_str()).await?;
        conn.flush().await
    }

    pub async fn register<S>(conn: &mut FrameConn<S>, port: u16) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::Register.as_str()).await?;
        conn.write_int(u64::from(port)).await?;
        conn.flush().await
    }

    pub async fn print<S>(conn: &mut FrameConn<S>, source: &str, text: &str) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::Print.as_str()).await?;
        conn.write_str(source).await?;
        conn.write_str(text).await?;
        conn.flush().await
    }

    pub async fn progress<S>(conn: &mut FrameConn<S>, request: &ProgressRequest) -> Result<bool, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::Progress.as_str()).await?;
        conn.write_int(request.job_id).await?;
        conn.write_f64(request.done).await?;
        conn.write_str(&request.label).await?;
        conn.flush().await?;
        conn.read_bool().await
    }

    pub async fn add_cmds<S>(conn: &mut FrameConn<S>, job_id: u64, cmds: &[u8]) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::AddCmds.as_str()).await?;
        conn.write_int(job_id).await?;
        conn.write_array(cmds).await?;
        conn.flush().await
    }

    pub async fn get_msgs<S>(conn: &mut FrameConn<S>) -> Result<Vec<u8>, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::GetMsgs.as_str()).await?;
        conn.flush().await?;
        conn.read_array().await
    }

    pub async fn stop_msg<S>(conn: &mut FrameConn<S>, job_id: u64) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::StopMsg.as_str()).await?;
        conn.write_int(job_id).await?;
        conn.flush().await
    }

    pub async fn llm_complete<S>(
        conn: &mut FrameConn<S>,
        job_id: u64,
        request: &[u8],
    ) -> Result<CompletionReply, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::LlmComplete.as_str()).await?;
        conn.write_int(job_id).await?;
        conn.write_array(request).await?;
        conn.flush().await?;
        Ok(CompletionReply {
            error: conn.read_string().await?,
            response: conn.read_array().await?,
        })
    }

    pub async fn call_tool<S>(conn: &mut FrameConn<S>, request: &CallToolRequest) -> Result<BuildReply, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::CallTool.as_str()).await?;
        conn.write_int(request.job_id).await?;
        conn.write_str(&request.unit).await?;
        conn.write_str(&request.tool).await?;
        conn.write_array(&request.params).await?;
        conn.flush().await?;
        BuildReply::read(conn).await
    }

    pub async fn secret<S>(conn: &mut FrameConn<S>, alias: &str) -> Result<String, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::Secret.as_str()).await?;
        conn.write_str(alias).await?;
        conn.flush().await?;
        conn.read_string().await
    }

    pub async fn sandbox_violation<S>(
        conn: &mut FrameConn<S>,
        request: &ViolationRequest,
    ) -> Result<bool, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.write_str(HostVerb::SandboxViolation.as_str()).await?;
        conn.write_int(request.job_id).await?;
        conn.write_str(&request.kind).await?;
        conn.write_str(&request.detail).await?;
        conn.flush().await?;
        conn.read_bool().await
    }
}
