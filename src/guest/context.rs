//! What a running tool sees of its supervisor

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::llm::{CompletionRequest, CompletionResponse, Message};
use crate::wire::{CallToolRequest, HostClient, ProgressRequest, ViolationRequest};

/// Per-call handle passed to [`Tool`](super::Tool) methods
///
/// Tool code runs on a blocking thread, so every method blocks on the RPC
/// to the supervisor.
pub struct ToolContext {
    job_id: u64,
    tool: String,
    client: HostClient,
    handle: Handle,
    cmds: Mutex<Vec<u8>>,
}

impl ToolContext {
    pub(crate) fn new(job_id: u64, tool: impl Into<String>, client: HostClient, handle: Handle) -> Self {
        Self {
            job_id,
            tool: tool.into(),
            client,
            handle,
            cmds: Mutex::new(Vec::new()),
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Report progress; `false` once the job was cancelled
    pub fn progress(&self, done: f64, label: &str) -> bool {
        let request = ProgressRequest {
            job_id: self.job_id,
            done,
            label: label.to_string(),
        };
        match self.handle.block_on(self.client.progress(&request)) {
            Ok(cancelled) => !cancelled,
            Err(e) => {
                tracing::warn!(job = self.job_id, error = %e, "Progress call failed");
                false
            }
        }
    }

    pub fn print(&self, text: &str) {
        if let Err(e) = self.handle.block_on(self.client.print(&self.tool, text)) {
            tracing::warn!(error = %e, "Print call failed");
        }
    }

    /// Queue side-effect commands; they travel back with the reply
    pub fn add_cmds(&self, cmds: &[u8]) {
        self.cmds.lock().extend_from_slice(cmds);
    }

    /// Deliver queued commands now instead of with the reply
    pub fn flush_cmds(&self) {
        let batch = std::mem::take(&mut *self.cmds.lock());
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.handle.block_on(self.client.add_cmds(self.job_id, &batch)) {
            tracing::warn!(job = self.job_id, error = %e, "Command flush failed");
        }
    }

    pub(crate) fn take_cmds(&self) -> Vec<u8> {
        std::mem::take(&mut *self.cmds.lock())
    }

    /// Secret value for `alias`; empty when unknown
    pub fn secret(&self, alias: &str) -> String {
        self.handle.block_on(self.client.secret(alias)).unwrap_or_else(|e| {
            tracing::warn!(alias, error = %e, "Secret lookup failed");
            String::new()
        })
    }

    /// Run another unit's tool as a nested call of this job
    ///
    /// An empty `unit` means this tool's own unit.
    pub fn call_tool(&self, unit: &str, tool: &str, params: Value) -> Result<Value, String> {
        let request = CallToolRequest {
            job_id: self.job_id,
            unit: unit.to_string(),
            tool: tool.to_string(),
            params: serde_json::to_vec(&params).map_err(|e| e.to_string())?,
        };
        let reply = self
            .handle
            .block_on(self.client.call_tool(&request))
            .map_err(|e| e.to_string())?;
        if reply.is_error() {
            return Err(reply.error);
        }
        if !reply.cmds.is_empty() {
            self.add_cmds(&reply.cmds);
        }
        serde_json::from_slice(&reply.data).map_err(|e| format!("invalid tool output: {e}"))
    }

    /// One-shot prompt to the supervisor's completion service
    pub fn complete(&self, prompt: &str) -> Result<String, String> {
        let request = CompletionRequest {
            messages: vec![Message::user(prompt)],
            ..CompletionRequest::default()
        };
        let body = serde_json::to_vec(&request).map_err(|e| e.to_string())?;
        let reply = self
            .handle
            .block_on(self.client.llm_complete(self.job_id, &body))
            .map_err(|e| e.to_string())?;
        if !reply.error.is_empty() {
            return Err(reply.error);
        }
        let response: CompletionResponse =
            serde_json::from_slice(&reply.response).map_err(|e| format!("invalid completion: {e}"))?;
        Ok(response.answer)
    }

    /// Report a policy violation; `true` means the operation must not proceed
    pub fn report_violation(&self, kind: &str, detail: &str) -> bool {
        let request = ViolationRequest {
            job_id: self.job_id,
            kind: kind.to_string(),
            detail: detail.to_string(),
        };
        self.handle
            .block_on(self.client.sandbox_violation(&request))
            .unwrap_or(true)
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("job_id", &self.job_id)
            .field("tool", &self.tool)
            .finish()
    }
}
