// Error types for Tunnel Bridge

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ResourceKind, ResourceState};

/// Failures while establishing or using the SSH transport session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("SSH authentication failed: {0}")]
    AuthFailed(String),

    #[error("SSH endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Port forwarding setup failed: {0}")]
    ForwardSetupFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("SSH session is not connected")]
    NotConnected,

    #[error("SSH connection timed out after {0:?}")]
    TimedOut(Duration),
}

/// Failures of a forwarded byte stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Connection reset: the transport session was closed")]
    ConnectionReset,

    #[error("Write to forwarded stream failed: {0}")]
    WriteFailed(String),
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err {
            StreamError::ConnectionReset => std::io::ErrorKind::ConnectionReset,
            StreamError::WriteFailed(_) => std::io::ErrorKind::BrokenPipe,
        };
        std::io::Error::new(kind, err)
    }
}

/// Failures of database commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Query timed out after {0:?}")]
    TimedOut(Duration),
}

/// Failures of serial port operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Failed to open serial port {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("No serial port is open")]
    NotOpen,

    #[error("Write to serial port failed: {0}")]
    WriteFailed(String),

    #[error("Failed to enumerate serial ports: {0}")]
    ListFailed(String),
}

/// Top-level error returned by bridge commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("{resource} is not ready (state: {state})")]
    NotReady {
        resource: ResourceKind,
        state: ResourceState,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::InvalidRequest(err.to_string())
    }
}

/// Machine-readable error category carried in command results
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailed,
    Unreachable,
    ForwardSetupFailed,
    HostKeyRejected,
    NotConnected,
    TimedOut,
    ConnectionReset,
    WriteFailed,
    ExecutionFailed,
    InvalidIdentifier,
    OpenFailed,
    NotOpen,
    ListFailed,
    NotReady,
    InvalidRequest,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Transport(e) => match e {
                TransportError::AuthFailed(_) => ErrorKind::AuthFailed,
                TransportError::Unreachable(_) => ErrorKind::Unreachable,
                TransportError::ForwardSetupFailed(_) => ErrorKind::ForwardSetupFailed,
                TransportError::HostKeyRejected(_) => ErrorKind::HostKeyRejected,
                TransportError::NotConnected => ErrorKind::NotConnected,
                TransportError::TimedOut(_) => ErrorKind::TimedOut,
            },
            BridgeError::Stream(e) => match e {
                StreamError::ConnectionReset => ErrorKind::ConnectionReset,
                StreamError::WriteFailed(_) => ErrorKind::WriteFailed,
            },
            BridgeError::Query(e) => match e {
                QueryError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
                QueryError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
                QueryError::TimedOut(_) => ErrorKind::TimedOut,
            },
            BridgeError::Port(e) => match e {
                PortError::OpenFailed { .. } => ErrorKind::OpenFailed,
                PortError::NotOpen => ErrorKind::NotOpen,
                PortError::WriteFailed(_) => ErrorKind::WriteFailed,
                PortError::ListFailed(_) => ErrorKind::ListFailed,
            },
            BridgeError::NotReady { .. } => ErrorKind::NotReady,
            BridgeError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

/// Missing or malformed environment configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, BridgeError>;
