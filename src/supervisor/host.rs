//! Host service - answers the verbs a guest sends to its supervisor

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::HostContext;
use crate::llm::CompletionRequest;
use crate::registry::{ActionKind, CallFrame, JobId, SandboxViolation};
use crate::wire::{BuildReply, CallToolRequest, CompletionReply, HostHandler, ProgressRequest, ViolationRequest};

pub struct HostService {
    unit: String,
    port: Arc<AtomicU16>,
    ctx: HostContext,
}

impl HostService {
    pub fn new(unit: impl Into<String>, port: Arc<AtomicU16>, ctx: HostContext) -> Self {
        Self {
            unit: unit.into(),
            port,
            ctx,
        }
    }

    async fn complete(&self, job: JobId, request: &[u8]) -> Result<Vec<u8>, String> {
        let service = self
            .ctx
            .completion
            .clone()
            .ok_or_else(|| "no completion service configured".to_string())?;
        let mut request: CompletionRequest =
            serde_json::from_slice(request).map_err(|e| format!("invalid completion request: {e}"))?;
        if request.model.is_empty() {
            request.model = self.ctx.default_model.clone();
        }

        let cancel = self
            .ctx
            .registry
            .cancel_token(job)
            .unwrap_or_else(tokio_util::sync::CancellationToken::new);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err("cancelled".to_string()),
            response = service.complete(&request) => response.map_err(|e| e.to_string())?,
        };
        serde_json::to_vec(&response).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl HostHandler for HostService {
    async fn register(&self, port: u16) {
        tracing::debug!(unit = %self.unit, port, "Guest register");
        self.port.store(port, Ordering::Release);
    }

    async fn print(&self, source: String, text: String) {
        tracing::info!(unit = %self.unit, source = %source, "{}", text.trim_end());
    }

    async fn progress(&self, request: ProgressRequest) -> bool {
        !self
            .ctx
            .registry
            .progress(JobId(request.job_id), request.done, request.label)
    }

    async fn add_cmds(&self, job_id: u64, cmds: Vec<u8>) {
        if !self.ctx.registry.add_cmds(JobId(job_id), cmds) {
            tracing::debug!(unit = %self.unit, job = job_id, "Commands for unknown job dropped");
        }
    }

    async fn get_msgs(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.ctx.registry.snapshot()).map_err(|e| {
            tracing::warn!(unit = %self.unit, error = %e, "Job snapshot failed to serialize");
            e.to_string()
        })
    }

    async fn stop_msg(&self, job_id: u64) {
        self.ctx.registry.stop(JobId(job_id));
    }

    async fn llm_complete(&self, job_id: u64, request: Vec<u8>) -> CompletionReply {
        match self.complete(JobId(job_id), &request).await {
            Ok(response) => CompletionReply {
                error: String::new(),
                response,
            },
            Err(error) => {
                tracing::warn!(unit = %self.unit, job = job_id, error = %error, "Guest completion failed");
                CompletionReply {
                    error,
                    response: Vec::new(),
                }
            }
        }
    }

    async fn call_tool(&self, request: CallToolRequest) -> BuildReply {
        let unit = if request.unit.is_empty() {
            self.unit.clone()
        } else {
            request.unit
        };
        let Some(tree) = self.ctx.tree.upgrade() else {
            return BuildReply::error("unit tree is gone");
        };
        let Some(target) = tree.find(&unit) else {
            return BuildReply::error(format!("unknown unit: {unit}"));
        };

        let parent = JobId(request.job_id);
        let frame = CallFrame::new(&unit, &request.tool, ActionKind::Build);
        let _guard = self.ctx.registry.push_frame(parent, frame);
        if self.ctx.registry.is_cancelled(parent) {
            return BuildReply::error("cancelled");
        }

        match target.invoke(Some(parent), &request.tool, request.params).await {
            Ok(reply) => reply,
            Err(e) => BuildReply::error(e.to_string()),
        }
    }

    async fn secret(&self, alias: String) -> String {
        match self.ctx.secrets.get(&alias) {
            Some(value) => value,
            None => {
                tracing::warn!(unit = %self.unit, alias = %alias, "Unknown secret requested");
                String::new()
            }
        }
    }

    async fn sandbox_violation(&self, request: ViolationRequest) -> bool {
        self.ctx.registry.record_violation(
            JobId(request.job_id),
            SandboxViolation {
                kind: request.kind,
                detail: request.detail,
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::SecretStore;
    use crate::llm::{CompletionResponse, Message, ScriptedCompletionService};
    use crate::registry::MessageRegistry;
    use crate::supervisor::CargoToolchain;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn service() -> (HostService, Arc<MessageRegistry>, Arc<ScriptedCompletionService>) {
        let registry = MessageRegistry::new(Duration::from_secs(5));
        let llm = Arc::new(ScriptedCompletionService::new());
        let secrets = SecretStore::from_map(BTreeMap::from([("mail".to_string(), "hunter2".to_string())]));
        let ctx = HostContext::new(registry.clone(), Arc::new(CargoToolchain::new("/unused")))
            .with_completion(llm.clone(), "llama3")
            .with_secrets(Arc::new(secrets));
        let svc = HostService::new("Calc", Arc::new(AtomicU16::new(0)), ctx);
        (svc, registry, llm)
    }

    #[tokio::test]
    async fn test_register_sets_port() {
        let (svc, _, _) = service();
        svc.register(4100).await;
        assert_eq!(svc.port.load(Ordering::Acquire), 4100);
    }

    #[tokio::test]
    async fn test_progress_reports_cancellation() {
        let (svc, registry, _) = service();
        let job = registry.create("Calc.Add", CallFrame::new("Calc", "Add", ActionKind::Build));
        let req = |done| ProgressRequest {
            job_id: job.0,
            done,
            label: "working".into(),
        };
        assert!(!svc.progress(req(0.5)).await);
        svc.stop_msg(job.0).await;
        assert!(svc.progress(req(0.6)).await);
        // Unknown jobs read as cancelled so the guest winds down
        assert!(svc.progress(ProgressRequest { job_id: 999, done: 0.1, label: String::new() }).await);
    }

    #[tokio::test]
    async fn test_llm_complete_fills_default_model() {
        let (svc, registry, llm) = service();
        llm.push(CompletionResponse::answer("42"));
        let job = registry.create("Calc.Ask", CallFrame::new("Calc", "Ask", ActionKind::Build));
        let request = CompletionRequest {
            messages: vec![Message::user("answer?")],
            ..CompletionRequest::default()
        };
        let reply = svc.llm_complete(job.0, serde_json::to_vec(&request).unwrap()).await;
        assert!(reply.error.is_empty(), "{}", reply.error);
        let response: CompletionResponse = serde_json::from_slice(&reply.response).unwrap();
        assert_eq!(response.answer, "42");
        assert_eq!(llm.requests()[0].model, "llama3");

        let bad = svc.llm_complete(job.0, b"not json".to_vec()).await;
        assert!(bad.error.starts_with("invalid completion request"));
    }

    #[tokio::test]
    async fn test_get_msgs_lists_jobs() {
        let (svc, registry, _) = service();
        registry.create("Calc.Add", CallFrame::new("Calc", "Add", ActionKind::Build));
        let msgs: serde_json::Value = serde_json::from_slice(&svc.get_msgs().await.unwrap()).unwrap();
        assert_eq!(msgs[0]["label"], "Calc.Add");
    }

    #[tokio::test]
    async fn test_secret_and_violation() {
        let (svc, registry, _) = service();
        assert_eq!(svc.secret("mail".into()).await, "hunter2");
        assert_eq!(svc.secret("nope".into()).await, "");

        let job = registry.create("Calc.Net", CallFrame::new("Calc", "Net", ActionKind::Build));
        let block = svc
            .sandbox_violation(ViolationRequest {
                job_id: job.0,
                kind: "network".into(),
                detail: "connect 1.2.3.4:80".into(),
            })
            .await;
        assert!(block);
    }

    #[tokio::test]
    async fn test_call_tool_without_tree_fails_softly() {
        let (svc, _, _) = service();
        let reply = svc
            .call_tool(CallToolRequest {
                job_id: 1,
                unit: String::new(),
                tool: "Add".into(),
                params: b"{}".to_vec(),
            })
            .await;
        assert_eq!(reply.error, "unit tree is gone");
    }
}
