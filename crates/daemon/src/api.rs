// Tunnel Bridge - REST API Module
// HTTP command endpoints and the SSE event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::Event,
    response::Sse,
    routing::{get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use tunnel_bridge_common::{
    CommandRequest, CommandResult, ConnectRequest, ErrorKind, OutgoingEvent, PortOptions,
    SendPayload, Utc,
};

use crate::controller::BridgeController;

/// Shared application state
pub struct AppState {
    pub controller: BridgeController,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    sql: String,
}

#[derive(Debug, Deserialize)]
struct OpenPortBody {
    path: String,
    #[serde(default)]
    options: PortOptions,
}

type CommandResponse = (StatusCode, Json<CommandResult>);

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/command", post(command))
        .route("/api/tunnel/connect", post(connect))
        .route("/api/tunnel/disconnect", post(disconnect))
        .route("/api/tunnel/tables", get(list_tables))
        .route("/api/tunnel/tables/:name", get(table_contents))
        .route("/api/tunnel/query", post(query))
        .route("/api/serial/ports", get(list_ports))
        .route("/api/serial/open", post(open_port))
        .route("/api/serial/send", post(send))
        .route("/api/serial/close", post(close_port))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

async fn run(state: &AppState, request: CommandRequest) -> CommandResponse {
    let result = state.controller.dispatch(request).await;
    (status_for(&result), Json(result))
}

/// HTTP status for a command outcome; the body is always the result itself
fn status_for(result: &CommandResult) -> StatusCode {
    if result.success {
        return StatusCode::OK;
    }
    match result.error_kind {
        Some(ErrorKind::NotReady) => StatusCode::CONFLICT,
        Some(ErrorKind::InvalidRequest) | Some(ErrorKind::InvalidIdentifier) => {
            StatusCode::BAD_REQUEST
        }
        Some(ErrorKind::TimedOut) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorKind::OpenFailed) | Some(ErrorKind::NotOpen) | Some(ErrorKind::ListFailed) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Some(_) => StatusCode::BAD_GATEWAY,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn status(State(state): State<Arc<AppState>>) -> CommandResponse {
    run(&state, CommandRequest::Status).await
}

/// Generic entry point taking a tagged `CommandRequest`
async fn command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> CommandResponse {
    run(&state, request).await
}

async fn connect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ConnectRequest>>,
) -> CommandResponse {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    info!("API: Connect request {:?}", request);
    run(&state, CommandRequest::Connect(request)).await
}

async fn disconnect(State(state): State<Arc<AppState>>) -> CommandResponse {
    info!("API: Disconnect request");
    run(&state, CommandRequest::Disconnect).await
}

async fn list_tables(State(state): State<Arc<AppState>>) -> CommandResponse {
    run(&state, CommandRequest::ListTables).await
}

async fn table_contents(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> CommandResponse {
    run(&state, CommandRequest::TableContents { table: name }).await
}

async fn query(State(state): State<Arc<AppState>>, Json(body): Json<QueryBody>) -> CommandResponse {
    run(&state, CommandRequest::Query { sql: body.sql }).await
}

async fn list_ports(State(state): State<Arc<AppState>>) -> CommandResponse {
    run(&state, CommandRequest::ListPorts).await
}

async fn open_port(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OpenPortBody>,
) -> CommandResponse {
    info!("API: Open serial port {}", body.path);
    run(
        &state,
        CommandRequest::OpenPort {
            path: body.path,
            options: body.options,
        },
    )
    .await
}

async fn send(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendPayload>,
) -> CommandResponse {
    run(&state, CommandRequest::Send { payload }).await
}

async fn close_port(State(state): State<Arc<AppState>>) -> CommandResponse {
    info!("API: Close serial port");
    run(&state, CommandRequest::ClosePort).await
}

/// GET /api/events  → SSE stream of bridge events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.controller.events().subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let bridge_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(ev) => encode(&OutgoingEvent::from(ev)).map(Ok),
            Err(lagged) => {
                // Slow consumer: skip what was dropped and keep going
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(bridge_events, heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn encode(event: &OutgoingEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            tracing::error!("Failed to serialize OutgoingEvent: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&OutgoingEvent::Heartbeat { timestamp: Utc::now() }) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use crate::testing::{FakeConnector, FakeDatabase, FakeSerialBackend};
    use tunnel_bridge_common::{BridgeConfig, CommandData, ResourceState};

    fn state() -> Arc<AppState> {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let controller = BridgeController::new(
            &BridgeConfig::default(),
            FakeConnector::new(),
            FakeDatabase::new(&[], 0),
            FakeSerialBackend::new(),
            EventSink::new(),
        );
        Arc::new(AppState {
            controller,
            shutdown_tx,
        })
    }

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        // With test interval override, we should see a heartbeat well within 1s.
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_for(&CommandResult::ok("done")), StatusCode::OK);

        let failed = |kind| CommandResult {
            success: false,
            message: Some("failed".to_string()),
            error_kind: Some(kind),
            data: None,
        };
        assert_eq!(status_for(&failed(ErrorKind::NotReady)), StatusCode::CONFLICT);
        assert_eq!(status_for(&failed(ErrorKind::InvalidRequest)), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&failed(ErrorKind::AuthFailed)), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&failed(ErrorKind::ExecutionFailed)), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&failed(ErrorKind::TimedOut)), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_query_without_tunnel_is_conflict() {
        let (code, Json(result)) = query(
            State(state()),
            Json(QueryBody {
                sql: "SELECT 1".to_string(),
            }),
        )
        .await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NotReady));
    }

    #[tokio::test]
    async fn test_connect_without_configuration_is_bad_request() {
        let (code, Json(result)) = connect(State(state()), None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(result.message.unwrap().contains("SSH_HOST"));
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (code, Json(result)) = status(State(state())).await;
        assert_eq!(code, StatusCode::OK);
        match result.data {
            Some(CommandData::Status(status)) => {
                assert_eq!(status.tunnel, ResourceState::Idle);
                assert_eq!(status.serial, ResourceState::Idle);
            }
            other => panic!("unexpected data: {:?}", other),
        }
    }

    #[test]
    fn test_encode_bridge_event() {
        let event = OutgoingEvent::Closed {
            source: tunnel_bridge_common::ResourceKind::Serial,
        };
        assert!(encode(&event).is_some());
    }
}
