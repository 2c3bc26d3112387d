// Tunnel Bridge - Forwarded Stream Module
// Byte-duplex adapter over one forwarded channel, bound to its session's lifetime

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use tunnel_bridge_common::StreamError;

/// Anything that can stand in for a socket
pub trait DuplexIo: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> DuplexIo for T {}

/// Boxed duplex, as handed out by channels and serial ports
pub type BoxedIo = Pin<Box<dyn DuplexIo>>;

/// Where a forwarded stream comes from and goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Host to connect to, as resolved by the SSH server
    pub host: String,
    pub port: u16,
    /// Local endpoint announced as the channel originator
    pub originator_host: String,
    pub originator_port: u16,
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.originator_host, self.originator_port, self.host, self.port
        )
    }
}

/// One forwarded channel exposed as `AsyncRead + AsyncWrite`
///
/// The stream holds a clone of its session's liveness token, never the session
/// itself. Once the token is cancelled every pending and future read or write
/// fails with `ConnectionReset`.
pub struct ForwardedStream {
    target: ForwardTarget,
    inner: BoxedIo,
    liveness: CancellationToken,
    reset: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl ForwardedStream {
    pub fn new(inner: BoxedIo, liveness: CancellationToken, target: ForwardTarget) -> Self {
        let reset = Box::pin(liveness.clone().cancelled_owned());
        Self {
            target,
            inner,
            liveness,
            reset,
        }
    }

    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    pub fn is_reset(&self) -> bool {
        self.liveness.is_cancelled()
    }

    /// Registers the waker on the liveness token; Ready means the session is gone
    fn poll_reset(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.liveness.is_cancelled() {
            return Poll::Ready(());
        }
        self.reset.as_mut().poll(cx)
    }
}

fn connection_reset() -> io::Error {
    StreamError::ConnectionReset.into()
}

impl AsyncRead for ForwardedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_reset(cx).is_ready() {
            return Poll::Ready(Err(connection_reset()));
        }
        this.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for ForwardedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_reset(cx).is_ready() {
            return Poll::Ready(Err(connection_reset()));
        }
        this.inner.as_mut().poll_write(cx, buf).map_err(|e| {
            if e.kind() == io::ErrorKind::ConnectionReset {
                e
            } else {
                StreamError::WriteFailed(e.to_string()).into()
            }
        })
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_reset(cx).is_ready() {
            return Poll::Ready(Err(connection_reset()));
        }
        this.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Nothing left to shut down once the session is gone
        if this.liveness.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        this.inner.as_mut().poll_shutdown(cx)
    }
}

impl fmt::Debug for ForwardedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedStream")
            .field("target", &self.target)
            .field("reset", &self.is_reset())
            .finish()
    }
}
