//! In-memory stand-in for the plugin daemon.
//!
//! [`MockDaemon::start`] wires a [`Session`] to two `tokio::io::duplex`
//! pipes, one per direction, and keeps the daemon ends, so tests can read
//! what the plugin writes and script what the daemon answers. Either
//! direction can be cut on its own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::Mutex;

use crate::frame::{BackwardsResponse, InboundFrame, InvokeRequest, OutboundEvent, OutboundFrame};
use crate::session::{InboundReceiver, Session, SessionConfig};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Daemon side of an in-memory session. Cheap to clone.
#[derive(Clone)]
pub struct MockDaemon {
    session: Session,
    lines: Arc<Mutex<Option<Lines<BufReader<DuplexStream>>>>>,
    writer: Arc<Mutex<Option<DuplexStream>>>,
}

impl MockDaemon {
    /// Session with default timeouts and no heartbeat.
    pub fn start() -> (Self, InboundReceiver) {
        Self::start_with(SessionConfig {
            heartbeat_interval: None,
            ..SessionConfig::default()
        })
    }

    pub fn start_with(config: SessionConfig) -> (Self, InboundReceiver) {
        let (plugin_wr, daemon_rd) = tokio::io::duplex(PIPE_CAPACITY);
        let (daemon_wr, plugin_rd) = tokio::io::duplex(PIPE_CAPACITY);
        let (session, inbound) = Session::start(plugin_rd, plugin_wr, config);
        let mock = Self {
            session,
            lines: Arc::new(Mutex::new(Some(BufReader::new(daemon_rd).lines()))),
            writer: Arc::new(Mutex::new(Some(daemon_wr))),
        };
        (mock, inbound)
    }

    pub fn session(&self) -> Session {
        self.session.clone()
    }

    /// Next frame the plugin wrote, heartbeats included. `None` once the
    /// plugin side has closed its writer or the daemon stopped reading.
    pub async fn next_frame(&self) -> Option<OutboundFrame> {
        let mut guard = self.lines.lock().await;
        let line = guard.as_mut()?.next_line().await.ok()??;
        serde_json::from_str(&line).ok()
    }

    /// Next backwards request, skipping heartbeats.
    pub async fn next_request(&self) -> Option<InvokeRequest> {
        loop {
            let frame = self.next_frame().await?;
            if frame.event == OutboundEvent::Heartbeat {
                continue;
            }
            if let Some(req) = frame.invoke_request() {
                return Some(req);
            }
        }
    }

    /// Like [`next_frame`](Self::next_frame) but gives up after `wait`.
    pub async fn next_frame_within(&self, wait: Duration) -> Option<OutboundFrame> {
        tokio::time::timeout(wait, self.next_frame()).await.ok().flatten()
    }

    pub async fn respond(&self, rsp: &BackwardsResponse) {
        if let Ok(frame) = InboundFrame::backwards_response(None, rsp) {
            self.send_frame(&frame).await;
        }
    }

    pub async fn reply(&self, request_id: &str, data: Value) {
        self.respond(&BackwardsResponse::response(request_id, data)).await;
    }

    pub async fn end(&self, request_id: &str) {
        self.respond(&BackwardsResponse::end(request_id)).await;
    }

    pub async fn error(&self, request_id: &str, message: &str) {
        self.respond(&BackwardsResponse::error(request_id, message)).await;
    }

    /// The daemon calling into the plugin.
    pub async fn request(&self, session_id: Option<&str>, data: Value) {
        self.send_frame(&InboundFrame::request(session_id, data)).await;
    }

    pub async fn send_frame(&self, frame: &InboundFrame) {
        if let Ok(line) = frame.to_line() {
            self.send_raw(&line).await;
        }
    }

    /// Write text as-is; no newline is added.
    pub async fn send_raw(&self, raw: &str) {
        self.send_bytes(raw.as_bytes()).await;
    }

    /// Write bytes as-is, valid UTF-8 or not.
    pub async fn send_bytes(&self, raw: &[u8]) {
        let mut guard = self.writer.lock().await;
        if let Some(w) = guard.as_mut() {
            let _ = w.write_all(raw).await;
            let _ = w.flush().await;
        }
    }

    /// Close the daemon's write side; the plugin reads end of stream.
    pub async fn hang_up(&self) {
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }

    /// Drop the daemon's read side. The plugin's next write fails with a
    /// broken pipe while its read side stays open.
    pub async fn stop_reading(&self) {
        self.lines.lock().await.take();
    }
}
