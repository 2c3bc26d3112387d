// In-memory stand-ins for the SSH session, database and serial ports

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;

use tunnel_bridge_common::{
    PortDescriptor, PortError, PortOptions, QueryError, Row, SshTarget, TransportError,
};

use crate::database::{Database, DatabaseLink};
use crate::serial::SerialBackend;
use crate::session::{Connector, TransportSession};
use crate::stream::{BoxedIo, ForwardTarget, ForwardedStream};

/// Session whose forwarded channels echo every byte back
pub struct FakeSession {
    endpoint: String,
    liveness: CancellationToken,
    refuse: AtomicBool,
    opened: Mutex<Vec<ForwardTarget>>,
    closes: AtomicUsize,
}

impl FakeSession {
    pub fn echo(endpoint: &str) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.to_string(),
            liveness: CancellationToken::new(),
            refuse: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn refuse_forwards(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn opened_targets(&self) -> Vec<ForwardTarget> {
        self.opened.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Simulate the server dropping the connection
    pub fn drop_remotely(&self) {
        self.liveness.cancel();
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn liveness(&self) -> CancellationToken {
        self.liveness.clone()
    }

    async fn open_forward(&self, target: &ForwardTarget) -> Result<ForwardedStream, TransportError> {
        if self.liveness.is_cancelled() {
            return Err(TransportError::NotConnected);
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ForwardSetupFailed("administratively prohibited".into()));
        }
        self.opened.lock().unwrap().push(target.clone());

        let (near, far) = duplex(4096);
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });
        Ok(ForwardedStream::new(Box::pin(near), self.liveness.clone(), target.clone()))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.liveness.cancel();
    }
}

/// Connector handing out `FakeSession`s, or a fixed error
#[derive(Default)]
pub struct FakeConnector {
    failure: Mutex<Option<TransportError>>,
    refuse_forwards: AtomicBool,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(err: TransportError) -> Arc<Self> {
        let connector = Self::default();
        *connector.failure.lock().unwrap() = Some(err);
        Arc::new(connector)
    }

    /// Sessions created from now on refuse every forward
    pub fn refuse_forwards(&self) {
        self.refuse_forwards.store(true, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn TransportSession>, TransportError> {
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let session = FakeSession::echo(&target.endpoint());
        session.refuse_forwards(self.refuse_forwards.load(Ordering::SeqCst));
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

/// Database returning canned tables and `row_count` generated rows
pub struct FakeDatabase {
    tables: Vec<String>,
    row_count: usize,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_sql: Mutex<Option<String>>,
}

impl FakeDatabase {
    pub fn new(tables: &[&str], row_count: usize) -> Arc<Self> {
        Arc::new(Self {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            row_count,
            delay: None,
            calls: AtomicUsize::new(0),
            last_sql: Mutex::new(None),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tables: Vec::new(),
            row_count: 1,
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            last_sql: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_sql(&self) -> Option<String> {
        self.last_sql.lock().unwrap().clone()
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn list_tables(&self, _link: &DatabaseLink) -> Result<Vec<String>, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.clone())
    }

    async fn query(&self, _link: &DatabaseLink, sql: &str) -> Result<Vec<Row>, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_sql.lock().unwrap() = Some(sql.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if sql.starts_with("BROKEN") {
            return Err(QueryError::ExecutionFailed("You have an error in your SQL syntax".into()));
        }

        Ok((0..self.row_count)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), json!(i));
                row
            })
            .collect())
    }
}

/// Serial backend whose ports are in-memory duplex pipes
#[derive(Default)]
pub struct FakeSerialBackend {
    ports: Vec<PortDescriptor>,
    /// Far ends of opened ports, kept so the ports do not see EOF
    far_ends: Mutex<Vec<(String, DuplexStream)>>,
    failing_shutdown: AtomicBool,
    opens: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
}

impl FakeSerialBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: vec![PortDescriptor {
                path: "/dev/ttyUSB0".to_string(),
                port_type: "usb".to_string(),
                manufacturer: Some("FTDI".to_string()),
                product: None,
                serial_number: None,
                vid: Some(0x0403),
                pid: Some(0x6001),
            }],
            ..Default::default()
        })
    }

    /// Ports opened from now on fail to shut down
    pub fn fail_shutdowns(&self, fail: bool) {
        self.failing_shutdown.store(fail, Ordering::SeqCst);
    }

    /// Opens from now on block the calling thread for `delay`
    pub fn slow_opens(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn take_far_end(&self, path: &str) -> Option<DuplexStream> {
        let mut ends = self.far_ends.lock().unwrap();
        let idx = ends.iter().position(|(p, _)| p == path)?;
        Some(ends.remove(idx).1)
    }
}

impl SerialBackend for FakeSerialBackend {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, PortError> {
        Ok(self.ports.clone())
    }

    fn open(&self, path: &str, _options: &PortOptions) -> Result<BoxedIo, PortError> {
        if path.contains("missing") {
            return Err(PortError::OpenFailed {
                path: path.to_string(),
                reason: "No such file or directory".to_string(),
            });
        }
        if let Some(delay) = *self.open_delay.lock().unwrap() {
            std::thread::sleep(delay);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (near, far) = duplex(4096);
        self.far_ends.lock().unwrap().push((path.to_string(), far));
        if self.failing_shutdown.load(Ordering::SeqCst) {
            Ok(Box::pin(FailingShutdown(near)))
        } else {
            Ok(Box::pin(near))
        }
    }
}

/// Duplex whose shutdown always errors
pub struct FailingShutdown(pub DuplexStream);

impl AsyncRead for FailingShutdown {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for FailingShutdown {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "device busy")))
    }
}
