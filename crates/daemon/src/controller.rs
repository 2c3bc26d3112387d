// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

// Tunnel Bridge - Bridge Controller
// Owns the tunnel and serial resources and runs every command against them

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use tunnel_bridge_common::{
    BridgeConfig, BridgeError, BridgeStatus, CommandData, CommandRequest, CommandResult,
    ConnectRequest, EventPayload, PortDescriptor, PortError, PortOptions, QueryError,
    ResourceKind, ResourceState, Result, Row, SendPayload, TunnelSettings, TunnelTarget,
};

use crate::database::{Database, DatabaseLink, ROW_LIMIT};
use crate::events::EventSink;
use crate::rendezvous::{RemoteEndpoint, Rendezvous};
use crate::serial::{ActivePort, SerialBackend};
use crate::session::{Connector, TransportSession};
use crate::stream::ForwardTarget;

/// Current state of one resource plus a label for status output
struct StateCell {
    inner: std::sync::Mutex<(ResourceState, Option<String>)>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new((ResourceState::Idle, None)),
        }
    }

    fn get(&self) -> ResourceState {
        self.lock().0
    }

    fn label(&self) -> Option<String> {
        self.lock().1.clone()
    }

    fn set(&self, state: ResourceState, label: Option<String>) {
        *self.lock() = (state, label);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (ResourceState, Option<String>)> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ActiveTunnel {
    id: Uuid,
    session: Arc<dyn TransportSession>,
    rendezvous: Rendezvous,
    link: DatabaseLink,
    watcher: JoinHandle<()>,
}

struct OpenPort {
    id: Uuid,
    port: ActivePort,
    watcher: JoinHandle<()>,
}

struct Inner {
    settings: TunnelSettings,
    rendezvous_port: u16,
    query_timeout: Option<Duration>,
    connector: Arc<dyn Connector>,
    database: Arc<dyn Database>,
    serial_backend: Arc<dyn SerialBackend>,
    events: EventSink,
    tunnel_state: StateCell,
    serial_state: StateCell,
    tunnel: Mutex<Option<ActiveTunnel>>,
    serial: Mutex<Option<OpenPort>>,
}

/// Single owner of the tunnel and the serial port
///
/// Each resource moves through Idle, Connecting, Ready and Closing. Commands
/// that need a resource fail with `NotReady` outside Ready, before doing any I/O.
#[derive(Clone)]
pub struct BridgeController {
    inner: Arc<Inner>,
}

impl BridgeController {
    pub fn new(
        config: &BridgeConfig,
        connector: Arc<dyn Connector>,
        database: Arc<dyn Database>,
        serial_backend: Arc<dyn SerialBackend>,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: config.tunnel.clone(),
                rendezvous_port: config.rendezvous_port,
                query_timeout: config.query_timeout,
                connector,
                database,
                serial_backend,
                events,
                tunnel_state: StateCell::new(),
                serial_state: StateCell::new(),
                tunnel: Mutex::new(None),
                serial: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    /// Run one command, tagging its logs with a fresh request id
    pub async fn dispatch(&self, request: CommandRequest) -> CommandResult {
        let span = info_span!("command", id = %Uuid::new_v4(), command = request.name());
        self.execute(request).instrument(span).await
    }

    async fn execute(&self, request: CommandRequest) -> CommandResult {
        debug!("Executing {:?}", request);
        let outcome = match request {
            CommandRequest::Connect(req) => self.connect(req).await.map(CommandResult::ok),
            CommandRequest::ListTables => self
                .list_tables()
                .await
                .map(|tables| CommandResult::with_data(CommandData::Tables(tables))),
            CommandRequest::Query { sql } => self
                .query(&sql)
                .await
                .map(|rows| CommandResult::with_data(CommandData::Rows(rows))),
            CommandRequest::TableContents { table } => self
                .table_contents(&table)
                .await
                .map(|rows| CommandResult::with_data(CommandData::Rows(rows))),
            CommandRequest::Disconnect => self.disconnect().await.map(CommandResult::ok),
            CommandRequest::ListPorts => self
                .list_ports()
                .await
                .map(|ports| CommandResult::with_data(CommandData::Ports(ports))),
            CommandRequest::OpenPort { path, options } => {
                self.open_port(path, options).await.map(CommandResult::ok)
            }
            CommandRequest::Send { payload } => self.send(payload).await.map(CommandResult::ok),
            CommandRequest::ClosePort => self.close_port().await.map(CommandResult::ok),
            CommandRequest::Status => Ok(CommandResult::with_data(CommandData::Status(
                self.status(),
            ))),
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!("Command failed: {}", e);
                CommandResult::failure(&e)
            }
        }
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            tunnel: self.inner.tunnel_state.get(),
            ssh_endpoint: self.inner.tunnel_state.label(),
            serial: self.inner.serial_state.get(),
            serial_path: self.inner.serial_state.label(),
        }
    }

    // ---- tunnel ----

    /// Open the SSH session, verify the database forward and start the rendezvous listener
    ///
    /// An existing tunnel is torn down first.
    pub async fn connect(&self, request: ConnectRequest) -> Result<String> {
        let target = self.inner.settings.resolve(&request)?;
        let endpoint = target.ssh.endpoint();

        let mut slot = self.inner.tunnel.lock().await;
        if let Some(active) = slot.take() {
            info!("Replacing existing tunnel to {}", active.session.endpoint());
            self.inner.teardown_tunnel(active).await;
        }

        self.inner
            .tunnel_state
            .set(ResourceState::Connecting, Some(endpoint.clone()));

        let (session, rendezvous) = match self.inner.establish(&target).await {
            Ok(established) => established,
            Err(e) => {
                self.inner.tunnel_state.set(ResourceState::Idle, None);
                self.inner.events.error(ResourceKind::Tunnel, e.to_string());
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        let link = DatabaseLink::through_rendezvous(&target.database, rendezvous.local_addr().port());
        let watcher = tokio::spawn(watch_tunnel(
            Arc::downgrade(&self.inner),
            id,
            session.liveness(),
        ));

        *slot = Some(ActiveTunnel {
            id,
            session,
            rendezvous,
            link: link.clone(),
            watcher,
        });
        self.inner
            .tunnel_state
            .set(ResourceState::Ready, Some(endpoint.clone()));
        drop(slot);

        info!(
            "Tunnel ready: {} -> {}:{}",
            endpoint, target.database.host, target.database.port
        );
        self.publish_initial_tables(link);

        Ok(format!(
            "Connected to {}, forwarding {}:{}",
            endpoint, target.database.host, target.database.port
        ))
    }

    fn publish_initial_tables(&self, link: DatabaseLink) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let listed = inner
                .bounded(inner.database.list_tables(&link))
                .await;
            match listed {
                Ok(tables) => {
                    debug!("Initial table listing: {} tables", tables.len());
                    inner
                        .events
                        .data(ResourceKind::Tunnel, EventPayload::Tables(tables));
                }
                Err(e) => {
                    warn!("Initial table listing failed: {}", e);
                    inner.events.error(ResourceKind::Tunnel, e.to_string());
                }
            }
        });
    }

    pub async fn disconnect(&self) -> Result<String> {
        let mut slot = self.inner.tunnel.lock().await;
        let active = slot.take().ok_or(BridgeError::NotReady {
            resource: ResourceKind::Tunnel,
            state: self.inner.tunnel_state.get(),
        })?;

        let endpoint = active.session.endpoint().to_string();
        self.inner.teardown_tunnel(active).await;
        Ok(format!("Disconnected from {}", endpoint))
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let link = self.ready_link().await?;
        Ok(self
            .inner
            .bounded(self.inner.database.list_tables(&link))
            .await?)
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let link = self.ready_link().await?;
        if sql.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("SQL must not be empty".to_string()));
        }

        let mut rows = self
            .inner
            .bounded(self.inner.database.query(&link, sql))
            .await?;
        rows.truncate(ROW_LIMIT);
        Ok(rows)
    }

    pub async fn table_contents(&self, table: &str) -> Result<Vec<Row>> {
        let link = self.ready_link().await?;
        let mut rows = self
            .inner
            .bounded(self.inner.database.table_contents(&link, table))
            .await?;
        rows.truncate(ROW_LIMIT);
        Ok(rows)
    }

    /// Database credentials for the live tunnel, or `NotReady`
    async fn ready_link(&self) -> Result<DatabaseLink> {
        let not_ready = |state| BridgeError::NotReady {
            resource: ResourceKind::Tunnel,
            state,
        };

        let state = self.inner.tunnel_state.get();
        if state != ResourceState::Ready {
            return Err(not_ready(state));
        }

        let slot = self.inner.tunnel.lock().await;
        match slot.as_ref() {
            Some(active) if !active.session.is_closed() => Ok(active.link.clone()),
            _ => Err(not_ready(self.inner.tunnel_state.get())),
        }
    }

    // ---- serial ----

    pub async fn list_ports(&self) -> Result<Vec<PortDescriptor>> {
        let backend = self.inner.serial_backend.clone();
        let ports = tokio::task::spawn_blocking(move || backend.list_ports())
            .await
            .map_err(|e| PortError::ListFailed(e.to_string()))??;
        Ok(ports)
    }

    /// Open `path`, closing any port that is already open
    pub async fn open_port(&self, path: String, options: PortOptions) -> Result<String> {
        if path.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("port path must not be empty".to_string()));
        }

        let mut slot = self.inner.serial.lock().await;
        if let Some(open) = slot.take() {
            info!("Closing {} before opening {}", open.port.path(), path);
            self.inner.teardown_port(open).await;
        }

        self.inner
            .serial_state
            .set(ResourceState::Connecting, Some(path.clone()));

        let backend = self.inner.serial_backend.clone();
        let (open_path, open_options) = (path.clone(), options.clone());
        let opened = tokio::task::spawn_blocking(move || backend.open(&open_path, &open_options))
            .await
            .unwrap_or_else(|e| {
                Err(PortError::OpenFailed {
                    path: path.clone(),
                    reason: e.to_string(),
                })
            });

        let io = match opened {
            Ok(io) => io,
            Err(e) => {
                self.inner.serial_state.set(ResourceState::Idle, None);
                self.inner.events.error(ResourceKind::Serial, e.to_string());
                return Err(e.into());
            }
        };

        let baud_rate = options.baud_rate;
        let port = ActivePort::start(path.clone(), options, io, self.inner.events.clone());
        let id = Uuid::new_v4();
        let watcher = tokio::spawn(watch_port(
            Arc::downgrade(&self.inner),
            id,
            port.closed_token(),
        ));

        *slot = Some(OpenPort { id, port, watcher });
        self.inner
            .serial_state
            .set(ResourceState::Ready, Some(path.clone()));

        Ok(format!("Opened {} at {} baud", path, baud_rate))
    }

    pub async fn send(&self, payload: SendPayload) -> Result<String> {
        let state = self.inner.serial_state.get();
        if state != ResourceState::Ready {
            return Err(BridgeError::NotReady {
                resource: ResourceKind::Serial,
                state,
            });
        }

        let mut slot = self.inner.serial.lock().await;
        match slot.as_mut() {
            Some(open) if open.port.is_open() => {
                let written = open.port.write(&payload).await?;
                Ok(format!("Sent {} bytes to {}", written, open.port.path()))
            }
            _ => Err(BridgeError::NotReady {
                resource: ResourceKind::Serial,
                state: self.inner.serial_state.get(),
            }),
        }
    }

    pub async fn close_port(&self) -> Result<String> {
        let mut slot = self.inner.serial.lock().await;
        let open = slot.take().ok_or(BridgeError::NotReady {
            resource: ResourceKind::Serial,
            state: self.inner.serial_state.get(),
        })?;

        let path = open.port.path().to_string();
        self.inner.teardown_port(open).await;
        Ok(format!("Closed {}", path))
    }

    /// Tear down both resources; failures are logged
    pub async fn shutdown(&self) {
        info!("Shutting down bridge resources");
        if let Some(active) = self.inner.tunnel.lock().await.take() {
            self.inner.teardown_tunnel(active).await;
        }
        if let Some(open) = self.inner.serial.lock().await.take() {
            self.inner.teardown_port(open).await;
        }
    }
}

impl Inner {
    async fn establish(
        &self,
        target: &TunnelTarget,
    ) -> Result<(Arc<dyn TransportSession>, Rendezvous)> {
        let session = self.connector.connect(&target.ssh).await?;

        // The first forward proves the database is reachable before reporting Ready
        let reachability = ForwardTarget {
            host: target.database.host.clone(),
            port: target.database.port,
            originator_host: "127.0.0.1".to_string(),
            originator_port: self.rendezvous_port,
        };
        if let Err(e) = session.open_forward(&reachability).await {
            session.close().await;
            return Err(e.into());
        }

        let remote = RemoteEndpoint {
            host: target.database.host.clone(),
            port: target.database.port,
        };
        match Rendezvous::bind(self.rendezvous_port, session.clone(), remote, self.events.clone()).await
        {
            Ok(rendezvous) => Ok((session, rendezvous)),
            Err(e) => {
                session.close().await;
                Err(e.into())
            }
        }
    }

    async fn teardown_tunnel(&self, active: ActiveTunnel) {
        let ActiveTunnel {
            session,
            rendezvous,
            watcher,
            ..
        } = active;

        self.tunnel_state
            .set(ResourceState::Closing, Some(session.endpoint().to_string()));
        watcher.abort();
        rendezvous.shutdown().await;
        session.close().await;
        self.tunnel_state.set(ResourceState::Idle, None);
        self.events.closed(ResourceKind::Tunnel);
    }

    async fn teardown_port(&self, open: OpenPort) {
        let OpenPort { port, watcher, .. } = open;

        self.serial_state
            .set(ResourceState::Closing, Some(port.path().to_string()));
        watcher.abort();
        port.close().await;
        self.serial_state.set(ResourceState::Idle, None);
        self.events.closed(ResourceKind::Serial);
    }

    /// Apply the configured query timeout, if any
    async fn bounded<T, F>(&self, fut: F) -> std::result::Result<T, QueryError>
    where
        F: Future<Output = std::result::Result<T, QueryError>>,
    {
        match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| QueryError::TimedOut(limit))?,
            None => fut.await,
        }
    }
}

/// Clear the tunnel slot if session `id` drops without a disconnect
async fn watch_tunnel(inner: Weak<Inner>, id: Uuid, liveness: CancellationToken) {
    liveness.cancelled().await;
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut slot = inner.tunnel.lock().await;
    if slot.as_ref().map(|active| active.id) != Some(id) {
        return;
    }
    let Some(active) = slot.take() else {
        return;
    };

    let endpoint = active.session.endpoint().to_string();
    warn!("SSH session to {} was lost", endpoint);
    active.rendezvous.shutdown().await;
    active.session.close().await;
    inner.tunnel_state.set(ResourceState::Idle, None);
    inner.events.error(
        ResourceKind::Tunnel,
        format!("SSH session to {} was lost", endpoint),
    );
    inner.events.closed(ResourceKind::Tunnel);
}

/// Clear the serial slot once port `id` closes on its own
async fn watch_port(inner: Weak<Inner>, id: Uuid, closed: CancellationToken) {
    closed.cancelled().await;
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut slot = inner.serial.lock().await;
    if slot.as_ref().map(|open| open.id) != Some(id) {
        return;
    }
    if let Some(open) = slot.take() {
        debug!("Serial port {} closed by the device", open.port.path());
        inner.serial_state.set(ResourceState::Idle, None);
    }
}
