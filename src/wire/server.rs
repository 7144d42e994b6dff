//! RPC server - accept loop plus one task per connection
//!
//! # Connection Flow
//!
//! ```text
//! peer ──connect──► accept loop ──spawn──► connection task
//!                                             │
//!                                             ├── read verb + fields
//!                                             ├── Dispatch (typed handler)
//!                                             ├── write reply
//!                                             └── close
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::frame::{FrameConn, FrameError, WireStats};
use super::verb::{dispatch_guest, dispatch_host, GuestHandler, HostHandler, Served};
use crate::metrics::Metrics;

/// Serves exactly one request on an accepted connection
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, conn: &mut FrameConn<TcpStream>) -> Result<Served, FrameError>;
}

/// Host verbs answered by a [`HostHandler`]
pub struct HostEndpoint<H: ?Sized>(pub Arc<H>);

#[async_trait]
impl<H: HostHandler + ?Sized> Dispatch for HostEndpoint<H> {
    async fn dispatch(&self, conn: &mut FrameConn<TcpStream>) -> Result<Served, FrameError> {
        dispatch_host(&*self.0, conn).await
    }
}

/// Guest verbs answered by a [`GuestHandler`]
pub struct GuestEndpoint<G: ?Sized>(pub Arc<G>);

#[async_trait]
impl<G: GuestHandler + ?Sized> Dispatch for GuestEndpoint<G> {
    async fn dispatch(&self, conn: &mut FrameConn<TcpStream>) -> Result<Served, FrameError> {
        dispatch_guest(&*self.0, conn).await
    }
}

/// A bound listener, not yet serving
pub struct RpcServer {
    listener: TcpListener,
    addr: SocketAddr,
    stats: Arc<WireStats>,
    metrics: Option<Arc<Metrics>>,
}

impl RpcServer {
    /// Bind the first free port in `base..base + range`
    ///
    /// A `base` of 0 asks the OS for an ephemeral port instead.
    pub async fn bind(host: IpAddr, base: u16, range: u16) -> std::io::Result<Self> {
        if base == 0 {
            let listener = TcpListener::bind((host, 0)).await?;
            return Self::from_listener(listener);
        }

        let mut last_err = None;
        for offset in 0..range.max(1) {
            let Some(port) = base.checked_add(offset) else {
                break;
            };
            match TcpListener::bind((host, port)).await {
                Ok(listener) => return Self::from_listener(listener),
                Err(e) => {
                    tracing::debug!(port, error = %e, "Port unavailable, trying next");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("no free port in {}..{}", base, base.saturating_add(range)),
            )
        }))
    }

    fn from_listener(listener: TcpListener) -> std::io::Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            stats: WireStats::new(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stats(&self) -> Arc<WireStats> {
        self.stats.clone()
    }

    /// Accept until `shutdown` fires; each connection gets its own task
    pub async fn serve<D: Dispatch>(self, dispatch: Arc<D>, shutdown: CancellationToken) {
        let port = self.port();
        tracing::info!(port, "RPC server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(port, error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            self.stats.connection_opened();
            let dispatch = dispatch.clone();
            let stats = self.stats.clone();
            let metrics = self.metrics.clone();
            let span = tracing::debug_span!("rpc_conn", port, %peer);

            tokio::spawn(
                async move {
                    let mut conn = FrameConn::with_stats(stream, stats, metrics.clone());
                    match dispatch.dispatch(&mut conn).await {
                        Ok(Served::Verb(verb)) => {
                            if let Some(m) = &metrics {
                                m.rpc_requests.with_label_values(&[verb]).inc();
                            }
                            tracing::trace!(verb, "Request served");
                        }
                        Ok(Served::Unknown) => {}
                        Err(e) if e.is_eof() => tracing::debug!("Peer closed mid-request"),
                        Err(e) => tracing::warn!(error = %e, "Connection failed"),
                    }
                    let _ = conn.shutdown().await;
                }
                .instrument(span),
            );
        }

        tracing::info!(port, "RPC server stopped");
    }

    /// Spawn [`RpcServer::serve`] on the runtime, returning the bound port
    pub fn spawn<D: Dispatch>(self, dispatch: Arc<D>, shutdown: CancellationToken) -> u16 {
        let port = self.port();
        tokio::spawn(self.serve(dispatch, shutdown));
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_bind_skips_taken_ports() {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = RpcServer::bind(host, 0, 1).await.unwrap();
        let taken = first.port();

        let second = RpcServer::bind(host, taken, 2).await;
        if let Ok(second) = second {
            assert_ne!(second.port(), taken);
        }
    }

    #[tokio::test]
    async fn test_bind_reports_exhausted_range() {
        let host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = RpcServer::bind(host, 0, 1).await.unwrap();
        assert!(RpcServer::bind(host, first.port(), 1).await.is_err());
    }
}
