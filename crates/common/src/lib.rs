// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

// Tunnel Bridge - Common Library
// Shared types, errors, configuration and the consumer-side client

pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod sse;
pub mod types;

pub use client::{BridgeClient, BridgeClientConfig};
pub use config::{
    BridgeConfig, DatabaseTarget, HostKeyPolicy, SshCredentials, SshTarget, TunnelSettings,
    TunnelTarget,
};
pub use error::{
    BridgeError, ConfigError, ErrorKind, PortError, QueryError, Result, StreamError,
    TransportError,
};
pub use network::{format_host_port, is_loopback_address};
pub use sse::EventListener;
pub use types::{
    BridgeEvent, BridgeStatus, CommandData, CommandRequest, CommandResult, ConnectRequest,
    EventPayload, FlowControl, OutgoingEvent, Parity, PortDescriptor, PortOptions, ResourceKind,
    ResourceState, Row, SendPayload,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
