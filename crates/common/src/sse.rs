// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

//! Server-Sent Events listener for bridge events
//!
//! Framework-agnostic SSE client that works with any async runtime (tokio).

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::client::BridgeClient;
use crate::types::OutgoingEvent;

/// Event listener for the daemon SSE stream
pub struct EventListener {
    client: BridgeClient,
}

impl EventListener {
    pub fn new(client: BridgeClient) -> Self {
        Self { client }
    }

    /// Start listening to daemon events
    /// Returns a channel receiver that yields events in arrival order.
    /// Automatically reconnects with exponential backoff if the stream drops.
    pub fn listen(&self) -> mpsc::Receiver<OutgoingEvent> {
        let (tx, rx) = mpsc::channel(100);

        let client = self.client.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                match Self::stream_events(&client, tx.clone()).await {
                    Ok(()) => backoff = Duration::from_secs(1),
                    Err(e) => tracing::warn!("Event stream error: {}", e),
                }

                // If receiver is dropped, stop trying
                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        rx
    }

    async fn stream_events(client: &BridgeClient, tx: mpsc::Sender<OutgoingEvent>) -> Result<()> {
        let url = client.config().endpoint("/api/events");

        let response = client
            .http()
            .get(&url)
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("Error reading event stream")?;
            for event in parser.push(&bytes) {
                if tx.send(event).await.is_err() {
                    tracing::debug!("Receiver dropped, stopping event listener");
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// Incremental SSE frame parser
///
/// Buffers raw bytes so multi-byte UTF-8 sequences split across chunks survive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed a chunk and return every complete event it finished
    pub fn push(&mut self, chunk: &[u8]) -> Vec<OutgoingEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&frame[..pos]);
            if let Some(event) = parse_sse_message(&text) {
                events.push(event);
            }
        }
        events
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parse one SSE message ("data: {json}" lines) into an event
fn parse_sse_message(message: &str) -> Option<OutgoingEvent> {
    let data: Vec<&str> = message
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();

    if data.is_empty() {
        return None;
    }

    let joined = data.join("\n");
    match serde_json::from_str::<OutgoingEvent>(&joined) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Failed to parse SSE event: {} (error: {})", joined, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventPayload, ResourceKind};

    #[test]
    fn test_parser_handles_split_frames() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: {\"type\":\"closed\",").is_empty());
        let events = parser.push(b"\"source\":\"serial\"}\n\n");
        assert_eq!(
            events,
            vec![OutgoingEvent::Closed {
                source: ResourceKind::Serial
            }]
        );
    }

    #[test]
    fn test_parser_multiple_frames_and_comments() {
        let mut parser = SseParser::default();
        let events = parser.push(
            b": keepalive\n\ndata: {\"type\":\"error\",\"source\":\"tunnel\",\"message\":\"boom\"}\n\n\
              data: {\"type\":\"data\",\"source\":\"serial\",\"payload\":{\"kind\":\"bytes\",\"data\":\"AQI=\"}}\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            OutgoingEvent::Data {
                source: ResourceKind::Serial,
                payload: EventPayload::Bytes(vec![1, 2]),
            }
        );
    }

    #[test]
    fn test_parser_ignores_garbage() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: not json\n\n").is_empty());
    }
}
