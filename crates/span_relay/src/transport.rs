use crate::config::{Endpoint, TransportConfig};
use crate::span::SpanBatch;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Error types for transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not reach the collector
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    /// I/O failure while writing a batch
    #[error("i/o error: {0}")]
    Io(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Operation timed out
    #[error("transport operation timed out")]
    Timeout,
    /// The transport has been closed
    #[error("transport is closed")]
    Closed,
    /// The configured endpoint cannot be used
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Ships encoded span batches to a collector.
///
/// Uses native async fn in traits. For dynamic dispatch use [`TransportBoxed`],
/// which every `Transport` implements through a blanket impl.
pub trait Transport: Send + Sync {
    /// Sends one batch. Encoding is the transport's business.
    fn send(&self, batch: SpanBatch) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Releases the transport. Best effort: the pipeline logs and ignores errors.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }

    /// Returns the transport name for diagnostics.
    fn name(&self) -> &str;
}

/// Boxed future returned by [`TransportBoxed`] methods.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn send_boxed(&self, batch: SpanBatch) -> TransportFuture<'_>;

    fn close_boxed(&self) -> TransportFuture<'_>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any Transport can be used as TransportBoxed
impl<T: Transport> TransportBoxed for T {
    fn send_boxed(&self, batch: SpanBatch) -> TransportFuture<'_> {
        Box::pin(self.send(batch))
    }

    fn close_boxed(&self) -> TransportFuture<'_> {
        Box::pin(self.close())
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Builds transports from configuration snapshots.
pub trait TransportFactory: Send + Sync {
    fn build(&self, config: &TransportConfig) -> Result<Arc<dyn TransportBoxed>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&TransportConfig) -> Result<Arc<dyn TransportBoxed>, TransportError> + Send + Sync,
{
    fn build(&self, config: &TransportConfig) -> Result<Arc<dyn TransportBoxed>, TransportError> {
        self(config)
    }
}

/// Maps each [`Endpoint`] to the matching built-in transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, config: &TransportConfig) -> Result<Arc<dyn TransportBoxed>, TransportError> {
        let transport: Arc<dyn TransportBoxed> = match &config.endpoint {
            Endpoint::Tcp { address } => Arc::new(TcpTransport::new(address.clone())?),
            Endpoint::File { path } => Arc::new(JsonFileTransport::new(path.clone())),
            Endpoint::Stdout { verbose } => Arc::new(StdoutTransport::new(*verbose)),
            Endpoint::Noop => Arc::new(NoopTransport::new()),
        };
        Ok(transport)
    }
}

/// Transport that discards every batch; installed while reporting is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

impl NoopTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for NoopTransport {
    async fn send(&self, _batch: SpanBatch) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Stdout transport for debugging
pub struct StdoutTransport {
    verbose: bool,
}

impl StdoutTransport {
    /// Creates a new stdout transport; a quiet one prints only the batch size
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Transport for StdoutTransport {
    async fn send(&self, batch: SpanBatch) -> Result<(), TransportError> {
        println!("=== Sending {} spans ===", batch.spans.len());
        if self.verbose {
            for span in &batch.spans {
                println!(
                    "Span: trace_id={:032x} span_id={:016x} name={} duration={}us error={:?}",
                    span.trace_id(),
                    span.span_id(),
                    span.name(),
                    span.duration_micros(),
                    span.error()
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Appends each batch to a file as one JSON array per line
pub struct JsonFileTransport {
    path: PathBuf,
}

impl JsonFileTransport {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Transport for JsonFileTransport {
    async fn send(&self, batch: SpanBatch) -> Result<(), TransportError> {
        let mut line = batch
            .to_json()
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        file.write_all(&line)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| TransportError::Io(e.to_string()))
    }

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Network transport: newline-delimited JSON batches over a TCP connection.
///
/// Connects lazily on the first send and reconnects on the next send after
/// a write failure. Every connect and write is bounded by a timeout, so a
/// stalled collector cannot hold the flush task (or a refresh waiting on it)
/// indefinitely.
pub struct TcpTransport {
    address: String,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
    closed: AtomicBool,
    io_timeout: Duration,
}

impl TcpTransport {
    /// Creates a transport for `host:port`. Does not connect yet.
    pub fn new(address: impl Into<String>) -> Result<Self, TransportError> {
        let address = address.into();
        let valid = address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(TransportError::InvalidEndpoint(format!(
                "expected host:port, got {:?}",
                address
            )));
        }
        Ok(Self {
            address,
            stream: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            io_timeout: Duration::from_secs(5),
        })
    }

    /// Sets the timeout applied to each connect and each batch write.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            address: self.address.clone(),
            reason,
        };
        match tokio::time::timeout(self.io_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                // Best effort; Nagle only delays small batches.
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(connect_error(e.to_string())),
            Err(_) => Err(connect_error("timed out".to_string())),
        }
    }
}

impl Transport for TcpTransport {
    async fn send(&self, batch: SpanBatch) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut payload = batch
            .to_json()
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        payload.push(b'\n');

        let mut guard = self.stream.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };

        let written = tokio::time::timeout(self.io_timeout, async {
            stream.write_all(&payload).await?;
            stream.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // Drop the broken connection; the next batch reconnects.
                *guard = None;
                Err(TransportError::Io(e.to_string()))
            }
            Err(_) => {
                *guard = None;
                Err(TransportError::Timeout)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

/// Transport that records every batch for verification
#[cfg(test)]
pub(crate) struct RecordingTransport {
    batches: std::sync::Mutex<Vec<SpanBatch>>,
    closed: AtomicBool,
}

#[cfg(test)]
impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self {
            batches: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(SpanBatch::len).collect()
    }

    pub(crate) fn span_names(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.spans.iter().map(|s| s.name().to_string()))
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    async fn send(&self, batch: SpanBatch) -> Result<(), TransportError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{ActiveSpan, TraceContext};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn batch_of(names: &[&str]) -> SpanBatch {
        SpanBatch::with_spans(
            names
                .iter()
                .map(|name| ActiveSpan::start(TraceContext::new_root(true), *name).finish())
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_noop_transport() {
        let transport = NoopTransport::new();
        assert!(transport.send(batch_of(&["a", "b"])).await.is_ok());
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_stdout_transport() {
        let transport = StdoutTransport::new(false);
        assert!(transport.send(batch_of(&["a"])).await.is_ok());
    }

    #[test]
    fn test_tcp_rejects_bad_address() {
        assert!(matches!(
            TcpTransport::new("no-port"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            TcpTransport::new(":9411"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(TcpTransport::new("127.0.0.1:9411").is_ok());
    }

    #[tokio::test]
    async fn test_tcp_sends_one_line_per_batch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(line);
            }
            received
        });

        let transport = TcpTransport::new(address).unwrap();
        transport.send(batch_of(&["a", "b"])).await.unwrap();
        transport.send(batch_of(&["c"])).await.unwrap();
        transport.close().await.unwrap();

        let lines = server.await.unwrap();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.as_array().map(Vec::len), Some(2));
        assert_eq!(first[1]["name"], "b");
    }

    #[tokio::test]
    async fn test_tcp_send_after_close_fails() {
        let transport = TcpTransport::new("127.0.0.1:9").unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.send(batch_of(&["a"])).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_is_reported() {
        // Bind then drop to get a port nothing listens on.
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let transport = TcpTransport::new(address)
            .unwrap()
            .with_io_timeout(Duration::from_millis(500));
        assert!(matches!(
            transport.send(batch_of(&["a"])).await,
            Err(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_json_file_appends_lines() {
        let path = std::env::temp_dir().join(format!("span_relay_{}.jsonl", rand::random::<u64>()));
        let transport = JsonFileTransport::new(path.clone());
        transport.send(batch_of(&["a"])).await.unwrap();
        transport.send(batch_of(&["b", "c"])).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second[0]["name"], "b");
    }

    #[test]
    fn test_default_factory_maps_endpoints() {
        let factory = DefaultTransportFactory;
        let build = |endpoint: Endpoint| factory.build(&TransportConfig::enabled(endpoint));

        assert_eq!(build(Endpoint::Noop).unwrap().name(), "noop");
        assert_eq!(build(Endpoint::Stdout { verbose: true }).unwrap().name(), "stdout");
        assert_eq!(
            build(Endpoint::File {
                path: PathBuf::from("spans.jsonl")
            })
            .unwrap()
            .name(),
            "json_file"
        );
        assert_eq!(
            build(Endpoint::Tcp {
                address: "localhost:9411".to_string()
            })
            .unwrap()
            .name(),
            "tcp"
        );
        assert!(build(Endpoint::Tcp {
            address: "localhost".to_string()
        })
        .is_err());
    }
}
