//! RPC clients - one TCP connection per call, no pooling, no retries
//!
//! [`GuestClient`] is what the supervisor uses to drive a guest process;
//! [`HostClient`] is what a guest uses to call back into its supervisor.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use super::frame::{FrameConn, FrameError};
use super::verb::{
    encode, BuildReply, BuildRequest, CallToolRequest, ChangeReply, ChangeRequest,
    CompletionReply, ProgressRequest, UpdateReply, UpdateRequest, ViolationRequest,
};

/// Transport failures surfaced to the caller of a single RPC
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("process has not registered a port")]
    NotRegistered,
}

impl From<FrameError> for RpcError {
    fn from(e: FrameError) -> Self {
        RpcError::ConnectionFailed(e.to_string())
    }
}

/// Address and timeout shared by both client flavours
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub host: IpAddr,
    pub port: u16,
    pub timeout: Option<Duration>,
}

impl Endpoint {
    pub fn localhost(port: u16) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn connect(&self) -> Result<FrameConn<TcpStream>, RpcError> {
        if self.port == 0 {
            return Err(RpcError::NotRegistered);
        }
        let addr = SocketAddr::new(self.host, self.port);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RpcError::ConnectionFailed(format!("{addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(FrameConn::new(stream))
    }

    /// Await one exchange under the optional timeout
    async fn bounded<T>(
        &self,
        exchange: impl Future<Output = Result<T, FrameError>>,
    ) -> Result<T, RpcError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| RpcError::ConnectionFailed(format!("timed out after {limit:?}")))?
                .map_err(RpcError::from),
            None => Ok(exchange.await?),
        }
    }
}

async fn close(mut conn: FrameConn<TcpStream>) {
    let _ = conn.shutdown().await;
}

/// Supervisor → guest calls
#[derive(Debug, Clone, Copy)]
pub struct GuestClient {
    endpoint: Endpoint,
}

impl GuestClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub async fn build(&self, request: &BuildRequest) -> Result<BuildReply, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::build(&mut conn, request)).await;
        close(conn).await;
        reply
    }

    pub async fn change(&self, request: &ChangeRequest) -> Result<ChangeReply, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::change(&mut conn, request)).await;
        close(conn).await;
        reply
    }

    pub async fn update(&self, request: &UpdateRequest) -> Result<UpdateReply, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::update(&mut conn, request)).await;
        close(conn).await;
        reply
    }

    pub async fn exit(&self) -> Result<(), RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::exit(&mut conn)).await;
        close(conn).await;
        reply
    }
}

/// Guest → supervisor calls
#[derive(Debug, Clone, Copy)]
pub struct HostClient {
    endpoint: Endpoint,
}

impl HostClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub async fn register(&self, port: u16) -> Result<(), RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::register(&mut conn, port)).await;
        close(conn).await;
        reply
    }

    pub async fn print(&self, source: &str, text: &str) -> Result<(), RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::print(&mut conn, source, text)).await;
        close(conn).await;
        reply
    }

    /// Returns `true` when the job has been cancelled
    pub async fn progress(&self, request: &ProgressRequest) -> Result<bool, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::progress(&mut conn, request)).await;
        close(conn).await;
        reply
    }

    pub async fn add_cmds(&self, job_id: u64, cmds: &[u8]) -> Result<(), RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::add_cmds(&mut conn, job_id, cmds)).await;
        close(conn).await;
        reply
    }

    pub async fn get_msgs(&self) -> Result<Vec<u8>, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::get_msgs(&mut conn)).await;
        close(conn).await;
        reply
    }

    pub async fn stop_msg(&self, job_id: u64) -> Result<(), RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::stop_msg(&mut conn, job_id)).await;
        close(conn).await;
        reply
    }

    pub async fn llm_complete(&self, job_id: u64, request: &[u8]) -> Result<CompletionReply, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::llm_complete(&mut conn, job_id, request)).await;
        close(conn).await;
        reply
    }

    pub async fn call_tool(&self, request: &CallToolRequest) -> Result<BuildReply, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::call_tool(&mut conn, request)).await;
        close(conn).await;
        reply
    }

    pub async fn secret(&self, alias: &str) -> Result<String, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::secret(&mut conn, alias)).await;
        close(conn).await;
        reply
    }

    /// Returns `true` when the offending operation must be blocked
    pub async fn sandbox_violation(&self, request: &ViolationRequest) -> Result<bool, RpcError> {
        let mut conn = self.endpoint.connect().await?;
        let reply = self.endpoint.bounded(encode::sandbox_violation(&mut conn, request)).await;
        close(conn).await;
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_zero_fails_fast() {
        let client = GuestClient::new(Endpoint::localhost(0));
        let request = BuildRequest {
            job_id: 1,
            ui_id: 1,
            tool: "Add".into(),
            params: b"{}".to_vec(),
        };
        assert!(matches!(client.build(&request).await, Err(RpcError::NotRegistered)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_failed() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HostClient::new(Endpoint::localhost(port));
        assert!(matches!(client.register(9).await, Err(RpcError::ConnectionFailed(_))));
    }
}
