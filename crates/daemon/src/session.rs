// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

// Tunnel Bridge - Transport Session Module
// Authenticated SSH session that opens direct-tcpip forwarded streams (russh)

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnel_bridge_common::{HostKeyPolicy, SshCredentials, SshTarget, TransportError};

use crate::known_hosts::{fingerprint, HostKeyStatus, KnownHosts};
use crate::stream::{ForwardTarget, ForwardedStream};

/// How often the liveness monitor checks the underlying connection
const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// Opens transport sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// A live, authenticated transport session
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// "host:port" of the remote endpoint
    fn endpoint(&self) -> &str;

    /// Cancelled once the session is closed, locally or by the remote side
    fn liveness(&self) -> CancellationToken;

    fn is_closed(&self) -> bool {
        self.liveness().is_cancelled()
    }

    /// Open one forwarded stream to `target`
    async fn open_forward(&self, target: &ForwardTarget) -> Result<ForwardedStream, TransportError>;

    /// Close the session; closing twice is a no-op
    async fn close(&self);
}

/// russh-backed connector with known_hosts verification
pub struct SshConnector {
    known_hosts_path: PathBuf,
    policy: HostKeyPolicy,
    connect_timeout: Option<Duration>,
}

impl SshConnector {
    pub fn new(
        known_hosts_path: PathBuf,
        policy: HostKeyPolicy,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            known_hosts_path,
            policy,
            connect_timeout,
        }
    }

    fn client_config() -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.nodelay = true;
        // Keepalives let a silently dropped connection surface as a closed session
        cfg.keepalive_interval = Some(Duration::from_secs(30));
        cfg.keepalive_max = 3;
        Arc::new(cfg)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn TransportSession>, TransportError> {
        let endpoint = target.endpoint();
        info!("Connecting to SSH server: {}", endpoint);

        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            known_hosts_path: self.known_hosts_path.clone(),
            policy: self.policy,
            rejection: rejection.clone(),
        };

        let connecting = client::connect(
            Self::client_config(),
            (target.host.as_str(), target.port),
            handler,
        );
        let connected = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| TransportError::TimedOut(limit))?,
            None => connecting.await,
        };

        let mut handle = match connected {
            Ok(handle) => handle,
            Err(e) => {
                let rejected = rejection
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                return Err(match rejected {
                    Some(reason) => TransportError::HostKeyRejected(reason),
                    None => TransportError::Unreachable(format!(
                        "Failed to connect to {}: {}",
                        endpoint, e
                    )),
                });
            }
        };

        if let Err(e) = authenticate(&mut handle, target).await {
            if let Err(err) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("Failed to disconnect after authentication failure: {}", err);
            }
            return Err(e);
        }

        info!("SSH authentication successful for {}@{}", target.username, endpoint);
        Ok(Arc::new(SshSession::start(handle, endpoint)))
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &SshTarget,
) -> Result<(), TransportError> {
    let user = target.username.as_str();
    let exchange_failed =
        |e: russh::Error| TransportError::Unreachable(format!("Authentication exchange failed: {}", e));

    let result = match &target.credentials {
        SshCredentials::Password(password) => {
            info!("Authenticating with password");
            handle
                .authenticate_password(user, password.as_str())
                .await
                .map_err(exchange_failed)?
        }
        SshCredentials::Key { path, passphrase } => {
            info!("Authenticating with key: {}", path.display());
            let key = load_secret_key(path, passphrase.as_ref().map(|p| p.as_str())).map_err(|e| {
                TransportError::AuthFailed(format!(
                    "Failed to load SSH key from {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(exchange_failed)?
                .flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
                .map_err(exchange_failed)?
        }
    };

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<&str> = remaining_methods.iter().map(|m| m.into()).collect();
            let methods = if methods.is_empty() {
                "no authentication methods available".to_string()
            } else {
                format!("server accepts: {}", methods.join(", "))
            };
            let reason = if partial_success {
                format!("partial success, further authentication required ({})", methods)
            } else {
                format!("credentials rejected for user '{}' ({})", user, methods)
            };
            error!("SSH authentication failed: {}", reason);
            Err(TransportError::AuthFailed(reason))
        }
    }
}

/// An authenticated russh session
pub struct SshSession {
    handle: Arc<Handle<ClientHandler>>,
    endpoint: String,
    liveness: CancellationToken,
    closed: AtomicBool,
    monitor: JoinHandle<()>,
}

impl SshSession {
    fn start(handle: Handle<ClientHandler>, endpoint: String) -> Self {
        let handle = Arc::new(handle);
        let liveness = CancellationToken::new();
        let monitor = tokio::spawn(monitor_connection(
            handle.clone(),
            liveness.clone(),
            endpoint.clone(),
        ));

        Self {
            handle,
            endpoint,
            liveness,
            closed: AtomicBool::new(false),
            monitor,
        }
    }
}

/// Cancel the liveness token when the remote side drops the connection
async fn monitor_connection(
    handle: Arc<Handle<ClientHandler>>,
    liveness: CancellationToken,
    endpoint: String,
) {
    let mut ticker = tokio::time::interval(LIVENESS_POLL);
    loop {
        tokio::select! {
            _ = liveness.cancelled() => break,
            _ = ticker.tick() => {
                if handle.is_closed() {
                    warn!("SSH connection to {} was closed by the remote side", endpoint);
                    liveness.cancel();
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl TransportSession for SshSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn liveness(&self) -> CancellationToken {
        self.liveness.clone()
    }

    async fn open_forward(&self, target: &ForwardTarget) -> Result<ForwardedStream, TransportError> {
        if self.is_closed() || self.handle.is_closed() {
            return Err(TransportError::NotConnected);
        }

        debug!("Opening forwarded channel {}", target);
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                target.host.clone(),
                u32::from(target.port),
                target.originator_host.clone(),
                u32::from(target.originator_port),
            )
            .await
            .map_err(|e| {
                TransportError::ForwardSetupFailed(format!(
                    "{}:{} refused by {}: {}",
                    target.host, target.port, self.endpoint, e
                ))
            })?;

        Ok(ForwardedStream::new(
            Box::pin(channel.into_stream()),
            self.liveness.clone(),
            target.clone(),
        ))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing SSH session to {}", self.endpoint);
        self.liveness.cancel();
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to disconnect gracefully: {}", e);
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.liveness.cancel();
        self.monitor.abort();
    }
}

/// russh client handler; verifies the server key against known_hosts
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
    policy: HostKeyPolicy,
    /// Why the host key was refused, read back by the connector
    rejection: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    fn reject(&self, reason: String) -> bool {
        warn!("{}", reason);
        *self
            .rejection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason);
        false
    }

    fn verify(&self, key: &PublicKey) -> anyhow::Result<bool> {
        let (host, port) = (self.host.as_str(), self.port);
        let mut known_hosts = KnownHosts::load_from(&self.known_hosts_path)?;

        match known_hosts.check(host, port, key) {
            HostKeyStatus::Trusted => {
                info!("Host key verified for {}:{}", host, port);
                Ok(true)
            }
            HostKeyStatus::Unknown => match self.policy {
                HostKeyPolicy::Strict => Ok(self.reject(format!(
                    "Host {}:{} is not in {} (fingerprint {})",
                    host,
                    port,
                    known_hosts.path().display(),
                    fingerprint(key)
                ))),
                _ => {
                    known_hosts.add(host, port, key);
                    known_hosts.save()?;
                    info!(
                        "Recorded new host key for {}:{} ({})",
                        host,
                        port,
                        fingerprint(key)
                    );
                    Ok(true)
                }
            },
            HostKeyStatus::Changed {
                stored_fingerprint,
                offered_fingerprint,
                line,
            } => {
                error!("REMOTE HOST IDENTIFICATION HAS CHANGED for {}:{}", host, port);
                error!("Expected fingerprint: {}", stored_fingerprint);
                error!("Offered fingerprint:  {}", offered_fingerprint);
                error!(
                    "If the change is legitimate, remove line {} from {}",
                    line,
                    known_hosts.path().display()
                );
                Ok(self.reject(format!(
                    "Host key for {}:{} changed (offered {})",
                    host, port, offered_fingerprint
                )))
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAny {
            warn!(
                "Accepting host key for {}:{} without verification ({})",
                self.host,
                self.port,
                fingerprint(server_public_key)
            );
            return Ok(true);
        }

        self.verify(server_public_key).map_err(|e| {
            russh::Error::from(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Host key verification failed: {}", e),
            ))
        })
    }
}
