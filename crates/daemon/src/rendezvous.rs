// Tunnel Bridge - Rendezvous Listener
// Loopback listener that pumps each accepted socket through a fresh forwarded channel

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnel_bridge_common::{ResourceKind, TransportError};

use crate::events::EventSink;
use crate::session::TransportSession;
use crate::stream::{ForwardTarget, ForwardedStream};

/// Consecutive channel-open failures after which the session is reported as unhealthy
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Remote endpoint every accepted connection is forwarded to
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

/// A running loopback listener; dropping it stops accepting
pub struct Rendezvous {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Rendezvous {
    /// Bind 127.0.0.1:`port` and start forwarding to `remote` over `session`
    pub async fn bind(
        port: u16,
        session: Arc<dyn TransportSession>,
        remote: RemoteEndpoint,
        events: EventSink,
    ) -> Result<Self, TransportError> {
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            TransportError::ForwardSetupFailed(format!(
                "Failed to bind rendezvous listener on {}: {}",
                bind_addr, e
            ))
        })?;
        let local_addr = listener.local_addr().unwrap_or(bind_addr);

        info!(
            "Rendezvous listening on {} -> {}:{} via {}",
            local_addr,
            remote.host,
            remote.port,
            session.endpoint()
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            session,
            remote,
            events,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop accepting and wait until the listener socket is released
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.task.abort();
        match (&mut self.task).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("Rendezvous listener on {} ended abnormally: {}", self.local_addr, e),
        }
        debug!("Rendezvous listener on {} released", self.local_addr);
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<dyn TransportSession>,
    remote: RemoteEndpoint,
    events: EventSink,
    shutdown: CancellationToken,
) {
    let liveness = session.liveness();
    let mut consecutive_failures = 0;

    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Rendezvous listener on {:?} shutting down", listener.local_addr());
                return;
            }
            _ = liveness.cancelled() => {
                debug!("Session closed, rendezvous listener stops accepting");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to accept rendezvous connection: {}", e);
                    continue;
                }
            },
        };

        debug!("Accepted rendezvous connection from {}", peer_addr);
        let target = ForwardTarget {
            host: remote.host.clone(),
            port: remote.port,
            originator_host: peer_addr.ip().to_string(),
            originator_port: peer_addr.port(),
        };

        let channel = match session.open_forward(&target).await {
            Ok(channel) => {
                consecutive_failures = 0;
                channel
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    "Failed to open forwarded channel ({}/{}): {}",
                    consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    events.error(
                        ResourceKind::Tunnel,
                        format!(
                            "Forwarding to {}:{} failed {} times in a row: {}",
                            remote.host, remote.port, consecutive_failures, e
                        ),
                    );
                    consecutive_failures = 0;
                }
                continue;
            }
        };

        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = pump(socket, channel).await {
                if e.kind() == std::io::ErrorKind::ConnectionReset {
                    debug!("Forwarded connection from {} reset: {}", peer_addr, e);
                } else {
                    warn!("Forwarded connection from {} failed: {}", peer_addr, e);
                    events.error(ResourceKind::Tunnel, format!("Forwarded stream failed: {}", e));
                }
            }
        });
    }
}

/// Copy bytes both ways until either side closes
async fn pump(mut socket: TcpStream, mut channel: ForwardedStream) -> std::io::Result<()> {
    let target = channel.target().clone();
    let (up, down) = copy_bidirectional(&mut socket, &mut channel).await?;
    debug!("Forwarded connection {} closed ({} bytes up, {} bytes down)", target, up, down);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tunnel_bridge_common::BridgeEvent;

    fn remote() -> RemoteEndpoint {
        RemoteEndpoint {
            host: "127.0.0.1".to_string(),
            port: 3306,
        }
    }

    #[tokio::test]
    async fn test_accepted_socket_is_forwarded() {
        let session = FakeSession::echo("bastion:22");
        let rendezvous = Rendezvous::bind(0, session.clone(), remote(), EventSink::new())
            .await
            .unwrap();

        let mut client = TcpStream::connect(rendezvous.local_addr()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let opened = session.opened_targets();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].host, "127.0.0.1");
        assert_eq!(opened[0].port, 3306);
        assert_eq!(opened[0].originator_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_forward_setup_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Rendezvous::bind(port, FakeSession::echo("bastion:22"), remote(), EventSink::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ForwardSetupFailed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_port_for_immediate_rebind() {
        let session = FakeSession::echo("bastion:22");
        let first = Rendezvous::bind(0, session.clone(), remote(), EventSink::new())
            .await
            .unwrap();
        let port = first.local_addr().port();

        first.shutdown().await;

        let second = Rendezvous::bind(port, session, remote(), EventSink::new())
            .await
            .unwrap();
        assert_eq!(second.local_addr().port(), port);
    }

    #[tokio::test]
    async fn test_listener_stops_when_session_closes() {
        let session = FakeSession::echo("bastion:22");
        let rendezvous = Rendezvous::bind(0, session.clone(), remote(), EventSink::new())
            .await
            .unwrap();
        assert!(rendezvous.is_running());

        session.close().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while rendezvous.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener kept running after session close");
    }

    #[tokio::test]
    async fn test_repeated_forward_failures_publish_error() {
        let session = FakeSession::echo("bastion:22");
        session.refuse_forwards(true);
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let rendezvous = Rendezvous::bind(0, session, remote(), events).await.unwrap();

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            let _ = TcpStream::connect(rendezvous.local_addr()).await.unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            BridgeEvent::Error { source, message } => {
                assert_eq!(source, ResourceKind::Tunnel);
                assert!(message.contains("3 times"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
