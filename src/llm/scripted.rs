//! Deterministic Completion Service that replays a fixed script
//!
//! Used by tests and dry runs: each call pops the next scripted reply and
//! records the request it was given.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::service::{CompletionError, CompletionRequest, CompletionResponse, CompletionService};

type Reply = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, CompletionError> + Send + Sync>;

pub struct ScriptedCompletionService {
    script: Mutex<VecDeque<Reply>>,
    repeat_last: Mutex<Option<CompletionResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl Default for ScriptedCompletionService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCompletionService {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat_last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// One plain answer per call, in order
    pub fn from_answers<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = Self::new();
        for answer in answers {
            service.push(CompletionResponse::answer(answer));
        }
        service
    }

    pub fn push(&self, response: CompletionResponse) {
        self.script
            .lock()
            .push_back(Box::new(move |_| Ok(response.clone())));
    }

    pub fn push_error(&self, code: u16, message: impl Into<String>) {
        let message = message.into();
        self.script.lock().push_back(Box::new(move |_| {
            Err(CompletionError::Status {
                code,
                message: message.clone(),
            })
        }));
    }

    /// Compute the reply from the request (e.g. echo a prompt detail back)
    pub fn push_with<F>(&self, reply: F)
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, CompletionError> + Send + Sync + 'static,
    {
        self.script.lock().push_back(Box::new(reply));
    }

    /// Answer with `response` forever once the script runs out
    pub fn repeat(&self, response: CompletionResponse) {
        *self.repeat_last.lock() = Some(response);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        self.requests.lock().push(request.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some(reply) => reply(request),
            None => match self.repeat_last.lock().clone() {
                Some(response) => Ok(response),
                None => Err(CompletionError::Request("script exhausted".into())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::service::{Message, StreamDelta};

    #[tokio::test]
    async fn test_replays_in_order_then_fails() {
        let service = ScriptedCompletionService::from_answers(["one", "two"]);
        let request = CompletionRequest::default();
        assert_eq!(service.complete(&request).await.unwrap().answer, "one");
        assert_eq!(service.complete(&request).await.unwrap().answer, "two");
        assert!(service.complete(&request).await.is_err());
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn test_default_stream_replays_deltas() {
        let service = ScriptedCompletionService::from_answers(["hello"]);
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            ..CompletionRequest::default()
        };
        let mut deltas = Vec::new();
        let response = service
            .complete_stream(&request, &mut |d| {
                deltas.push(d);
                true
            })
            .await
            .unwrap();
        assert_eq!(response.answer, "hello");
        assert_eq!(deltas, vec![StreamDelta::Text("hello".into())]);
        assert_eq!(service.requests()[0].messages[0].content, "hi");
    }
}
