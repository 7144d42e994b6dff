//! Frame transport - the two wire primitives every exchange is built from
//!
//! A frame is either a fixed 8-byte little-endian `u64`, or an array: an
//! 8-byte little-endian length followed by exactly that many raw bytes.
//!
//! ```text
//! ┌──────────────┐      ┌──────────────┬──────────────────────┐
//! │ u64 (8B, LE) │      │ len (8B, LE) │ payload (len bytes)  │
//! └──────────────┘      └──────────────┴──────────────────────┘
//!      int frame                   array frame
//! ```
//!
//! There is no resynchronization: a short or corrupt stream is fatal to the
//! connection and the error is handed back to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::metrics::Metrics;

/// Largest array accepted by default (256 MiB)
pub const DEFAULT_MAX_ARRAY_LEN: u64 = 256 * 1024 * 1024;

/// Error type for frame operations
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("array of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: u64, max: u64 },

    #[error("array is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The handler could not produce a reply; the connection is dropped
    #[error("handler failed: {0}")]
    Handler(String),
}

impl FrameError {
    /// True when the peer closed the connection before a frame started
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Byte counters shared by every connection a server accepts
#[derive(Debug, Default)]
pub struct WireStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    connections: AtomicU64,
}

impl WireStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }
}

/// A framed connection over any async byte stream
///
/// Client connections carry no statistics; connections accepted by a server
/// are created with [`FrameConn::with_stats`] and feed the shared counters.
pub struct FrameConn<S> {
    stream: S,
    max_array_len: u64,
    stats: Option<Arc<WireStats>>,
    metrics: Option<Arc<Metrics>>,
}

impl<S> FrameConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            stats: None,
            metrics: None,
        }
    }

    /// Server variant: accumulate byte counters for observability
    pub fn with_stats(stream: S, stats: Arc<WireStats>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            stream,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            stats: Some(stats),
            metrics,
        }
    }

    pub fn set_max_array_len(&mut self, max: u64) {
        self.max_array_len = max;
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Write exactly 8 bytes, little-endian
    pub async fn write_int(&mut self, value: u64) -> Result<(), FrameError> {
        self.stream.write_all(&value.to_le_bytes()).await?;
        self.count_written(8);
        Ok(())
    }

    /// Read exactly 8 bytes, little-endian
    pub async fn read_int(&mut self) -> Result<u64, FrameError> {
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf).await?;
        self.count_read(8);
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a length-prefixed byte array
    pub async fn write_array(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        self.write_int(bytes.len() as u64).await?;
        self.stream.write_all(bytes).await?;
        self.count_written(bytes.len() as u64);
        Ok(())
    }

    /// Read a length-prefixed byte array
    ///
    /// `read_exact` keeps reading until the announced count has arrived;
    /// a short read is retried, only a closed stream ends it early.
    pub async fn read_array(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.read_int().await?;
        if len > self.max_array_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_array_len,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf).await?;
        self.count_read(len);
        Ok(buf)
    }

    pub async fn write_str(&mut self, value: &str) -> Result<(), FrameError> {
        self.write_array(value.as_bytes()).await
    }

    pub async fn read_string(&mut self) -> Result<String, FrameError> {
        let bytes = self.read_array().await?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Floats travel as their IEEE-754 bit pattern inside an int frame
    pub async fn write_f64(&mut self, value: f64) -> Result<(), FrameError> {
        self.write_int(value.to_bits()).await
    }

    pub async fn read_f64(&mut self) -> Result<f64, FrameError> {
        Ok(f64::from_bits(self.read_int().await?))
    }

    pub async fn write_bool(&mut self, value: bool) -> Result<(), FrameError> {
        self.write_int(u64::from(value)).await
    }

    pub async fn read_bool(&mut self) -> Result<bool, FrameError> {
        Ok(self.read_int().await? != 0)
    }

    pub async fn flush(&mut self) -> Result<(), FrameError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and close the write half
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn count_read(&self, n: u64) {
        if let Some(stats) = &self.stats {
            stats.bytes_read.fetch_add(n, Ordering::Relaxed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.wire_bytes_read.inc_by(n);
        }
    }

    fn count_written(&self, n: u64) {
        if let Some(stats) = &self.stats {
            stats.bytes_written.fetch_add(n, Ordering::Relaxed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.wire_bytes_written.inc_by(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_int_is_eight_bytes_little_endian() {
        let (a, mut b) = duplex(64);
        let mut conn = FrameConn::new(a);
        conn.write_int(0x0102_0304_0506_0708).await.unwrap();
        conn.flush().await.unwrap();

        let mut raw = [0u8; 8];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_array_round_trip_including_empty() {
        let (a, b) = duplex(1024);
        let mut writer = FrameConn::new(a);
        let mut reader = FrameConn::new(b);

        for payload in [Vec::new(), b"hello".to_vec(), vec![0xffu8; 700]] {
            let expected = payload.clone();
            let write = async {
                writer.write_array(&payload).await.unwrap();
                writer.flush().await.unwrap();
            };
            let (_, got) = tokio::join!(write, reader.read_array());
            assert_eq!(got.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_array_survives_split_reads() {
        // A one-byte pipe forces read_exact through many partial reads
        let (a, b) = duplex(1);
        let mut writer = FrameConn::new(a);
        let mut reader = FrameConn::new(b);
        let payload: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
        let expected = payload.clone();

        let write = tokio::spawn(async move {
            writer.write_array(&payload).await.unwrap();
            writer.flush().await.unwrap();
        });
        let got = reader.read_array().await.unwrap();
        write.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_truncated_array_is_an_error() {
        let (a, b) = duplex(64);
        let mut raw = FrameConn::new(a);
        raw.write_int(10).await.unwrap();
        raw.stream.write_all(b"abc").await.unwrap();
        drop(raw);

        let mut reader = FrameConn::new(b);
        let err = reader.read_array().await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_oversize_length_rejected_before_allocating() {
        let (a, b) = duplex(64);
        let mut writer = FrameConn::new(a);
        writer.write_int(u64::MAX).await.unwrap();

        let mut reader = FrameConn::new(b);
        reader.set_max_array_len(1024);
        assert!(matches!(
            reader.read_array().await,
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_stats_count_both_directions() {
        let stats = WireStats::new();
        let (a, b) = duplex(256);
        let mut server = FrameConn::with_stats(a, stats.clone(), None);
        let mut client = FrameConn::new(b);

        client.write_str("verb").await.unwrap();
        let verb = server.read_string().await.unwrap();
        assert_eq!(verb, "verb");
        server.write_f64(0.5).await.unwrap();
        assert_eq!(client.read_f64().await.unwrap(), 0.5);

        assert_eq!(stats.bytes_read(), 12);
        assert_eq!(stats.bytes_written(), 8);
    }
}
