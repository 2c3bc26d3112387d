// Common types for Tunnel Bridge
// Command, result and event shapes shared by the daemon and its consumers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{BridgeError, ErrorKind};

/// One result row: column name mapped to its JSON-converted value
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The two resources owned by the bridge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// SSH session plus forwarded database stream
    Tunnel,
    /// Serial port
    Serial,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Tunnel => f.write_str("tunnel"),
            ResourceKind::Serial => f.write_str("serial"),
        }
    }
}

/// Lifecycle state of a bridge resource
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    #[default]
    Idle,
    Connecting,
    Ready,
    Closing,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Idle => f.write_str("idle"),
            ResourceState::Connecting => f.write_str("connecting"),
            ResourceState::Ready => f.write_str("ready"),
            ResourceState::Closing => f.write_str("closing"),
        }
    }
}

/// Optional overrides for a tunnel connect; unset fields fall back to the environment
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<Zeroizing<String>>,
    pub mysql_host: Option<String>,
    pub mysql_port: Option<u16>,
    pub mysql_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_password: Option<Zeroizing<String>>,
    pub mysql_database: Option<String>,
}

// Manual Debug impl so passwords never reach the logs
impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("has_ssh_password", &self.ssh_password.is_some())
            .field("mysql_host", &self.mysql_host)
            .field("mysql_port", &self.mysql_port)
            .field("mysql_user", &self.mysql_user)
            .field("has_mysql_password", &self.mysql_password.is_some())
            .field("mysql_database", &self.mysql_database)
            .finish()
    }
}

/// Parity setting for a serial port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Flow control setting for a serial port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial port line settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortOptions {
    pub baud_rate: u32,
    /// 5, 6, 7 or 8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// An enumerated serial port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortDescriptor {
    pub path: String,
    /// "usb", "pci", "bluetooth" or "unknown"
    pub port_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
}

/// Outbound serial payload, chosen explicitly by the caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SendPayload {
    /// Text; a trailing newline is appended when missing
    Text(String),
    /// Raw bytes, sent verbatim (base64 on the wire)
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
}

/// Commands accepted by the bridge controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandRequest {
    Connect(ConnectRequest),
    ListTables,
    Query {
        sql: String,
    },
    TableContents {
        table: String,
    },
    Disconnect,
    ListPorts,
    OpenPort {
        path: String,
        #[serde(default)]
        options: PortOptions,
    },
    Send {
        payload: SendPayload,
    },
    ClosePort,
    Status,
}

impl CommandRequest {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CommandRequest::Connect(_) => "connect",
            CommandRequest::ListTables => "list_tables",
            CommandRequest::Query { .. } => "query",
            CommandRequest::TableContents { .. } => "table_contents",
            CommandRequest::Disconnect => "disconnect",
            CommandRequest::ListPorts => "list_ports",
            CommandRequest::OpenPort { .. } => "open_port",
            CommandRequest::Send { .. } => "send",
            CommandRequest::ClosePort => "close_port",
            CommandRequest::Status => "status",
        }
    }
}

/// Snapshot of both resources
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeStatus {
    pub tunnel: ResourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_endpoint: Option<String>,
    pub serial: ResourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_path: Option<String>,
}

/// Payload of a successful command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CommandData {
    Tables(Vec<String>),
    Rows(Vec<Row>),
    Ports(Vec<PortDescriptor>),
    Status(BridgeStatus),
}

/// Result of a command: success flag plus message or data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<CommandData>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error_kind: None,
            data: None,
        }
    }

    pub fn with_data(data: CommandData) -> Self {
        Self {
            success: true,
            message: None,
            error_kind: None,
            data: Some(data),
        }
    }

    pub fn failure(err: &BridgeError) -> Self {
        Self {
            success: false,
            message: Some(err.to_string()),
            error_kind: Some(err.kind()),
            data: None,
        }
    }
}

/// Data carried by a `data` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Table names published once a tunnel becomes ready
    Tables(Vec<String>),
}

/// Asynchronous notification pushed to consumers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Data {
        source: ResourceKind,
        payload: EventPayload,
    },
    Error {
        source: ResourceKind,
        message: String,
    },
    Closed {
        source: ResourceKind,
    },
}

/// Event as written to the SSE stream (bridge events plus keepalives)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingEvent {
    Data {
        source: ResourceKind,
        payload: EventPayload,
    },
    Error {
        source: ResourceKind,
        message: String,
    },
    Closed {
        source: ResourceKind,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl From<BridgeEvent> for OutgoingEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Data { source, payload } => OutgoingEvent::Data { source, payload },
            BridgeEvent::Error { source, message } => OutgoingEvent::Error { source, message },
            BridgeEvent::Closed { source } => OutgoingEvent::Closed { source },
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_request_wire_shape() {
        let json = r#"{"command":"open_port","path":"/dev/ttyUSB0"}"#;
        let req: CommandRequest = serde_json::from_str(json).unwrap();
        match req {
            CommandRequest::OpenPort { path, options } => {
                assert_eq!(path, "/dev/ttyUSB0");
                assert_eq!(options, PortOptions::default());
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let req: CommandRequest = serde_json::from_str(r#"{"command":"connect"}"#).unwrap();
        assert_eq!(req.name(), "connect");
    }

    #[test]
    fn test_send_payload_bytes_are_base64() {
        let payload = SendPayload::Bytes(vec![0x01, 0x02]);
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"kind":"bytes","data":"AQI="}"#);

        let parsed: SendPayload = serde_json::from_str(r#"{"kind":"text","data":"AT"}"#).unwrap();
        assert_eq!(parsed, SendPayload::Text("AT".to_string()));
    }

    #[test]
    fn test_connect_request_debug_redacts_passwords() {
        let req = ConnectRequest {
            ssh_password: Some(Zeroizing::new("hunter2".to_string())),
            mysql_password: Some(Zeroizing::new("s3cret".to_string())),
            ..Default::default()
        };
        let debug = format!("{:?}", req);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("has_ssh_password: true"));
    }

    #[test]
    fn test_connect_request_passwords_deserialize_as_secrets() {
        let req: ConnectRequest =
            serde_json::from_str(r#"{"ssh_host":"bastion","ssh_password":"hunter2"}"#).unwrap();
        let password: &Zeroizing<String> = req.ssh_password.as_ref().unwrap();
        assert_eq!(password.as_str(), "hunter2");
        assert!(req.mysql_password.is_none());
    }

    #[test]
    fn test_event_serialization() {
        let event: OutgoingEvent = BridgeEvent::Closed {
            source: ResourceKind::Serial,
        }
        .into();
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"type":"closed","source":"serial"}"#
        );

        let data = BridgeEvent::Data {
            source: ResourceKind::Tunnel,
            payload: EventPayload::Tables(vec!["users".to_string()]),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains(r#""kind":"tables""#));
    }

    #[test]
    fn test_failure_result_carries_kind() {
        let err = BridgeError::NotReady {
            resource: ResourceKind::Tunnel,
            state: ResourceState::Idle,
        };
        let result = CommandResult::failure(&err);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NotReady));
        assert!(result.data.is_none());
    }
}
