//! The process-wide connection to the plugin daemon.
//!
//! A [`Session`] owns the transport halves (through its reader and writer
//! tasks), the correlation table and the heartbeat. It is a cheap handle:
//! clone it into every invocation wrapper. Construct it once with
//! [`Session::start`] and tear it down with [`Session::close`].
//!
//! ```ignore
//! let (session, mut inbound) = Session::start(tokio::io::stdin(), tokio::io::stdout(), SessionConfig::default());
//! let mut sub = session.send(None, InvokeType::Storage, json!({"opt": "get", "key": "k"}))?;
//! while let Some(frame) = sub.recv().await? {
//!     println!("{frame}");
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlation::CorrelationTable;
use crate::dispatcher;
use crate::error::{InvokeError, Result};
use crate::frame::{InboundFrame, InvokeRequest, OutboundFrame, RequestId};
use crate::heartbeat;
use crate::kind::InvokeType;
use crate::mailbox::{Mailbox, Received};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// The knobs the runtime itself needs. Everything else is startup wiring.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Upper bound for a backwards request to reach its terminal frame.
    pub request_timeout: Duration,
    /// `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Frames buffered per request before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Terminal. Carries the reason the session went down.
    Closed(String),
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }
}

/// Requests the daemon makes into the plugin, forwarded untouched.
///
/// The channel is unbounded: the dispatcher never waits on it, so a holder
/// must keep draining it or drop it. Once dropped, daemon requests are
/// discarded with a debug log.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundFrame>;

/// State shared by the handle, the reader, the writer and the heartbeat.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) table: CorrelationTable,
    pub(crate) outbound: mpsc::UnboundedSender<String>,
    pub(crate) state: watch::Sender<SessionState>,
    pub(crate) config: SessionConfig,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.state.borrow().is_closed()
    }

    /// Move to the closed state and fail every outstanding request. Only the
    /// first call has an effect.
    pub(crate) fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let changed = self.state.send_if_modified(|st| {
            if st.is_closed() {
                false
            } else {
                *st = SessionState::Closed(reason.clone());
                true
            }
        });
        if changed {
            let failed = self.table.fail_all(&InvokeError::ConnectionClosed(reason.clone()));
            info!(%reason, failed, "plugin session closed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Spawn the reader, writer and (if configured) heartbeat tasks over the
    /// given transport halves. Must be called inside a tokio runtime.
    pub fn start<R, W>(reader: R, writer: W, config: SessionConfig) -> (Self, InboundReceiver)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Open);

        let shared = Arc::new(Shared {
            table: CorrelationTable::new(config.queue_capacity),
            outbound: out_tx,
            state,
            config,
        });

        tokio::spawn(dispatcher::write_loop(writer, out_rx, Arc::clone(&shared)));
        tokio::spawn(dispatcher::read_loop(reader, in_tx, Arc::clone(&shared)));

        let session = Self { shared };
        if let Some(every) = session.shared.config.heartbeat_interval {
            heartbeat::spawn(session.clone(), every);
        }
        debug!(config = ?session.shared.config, "plugin session started");
        (session, in_rx)
    }

    /// Issue a backwards request and return the subscription for its frames.
    ///
    /// The correlation entry exists before the frame is written, so no reply
    /// can outrun its subscriber.
    pub fn send(
        &self,
        session_id: Option<&str>,
        kind: InvokeType,
        payload: Value,
    ) -> Result<Subscription> {
        self.ensure_open()?;

        let id: RequestId = Uuid::new_v4().simple().to_string();
        let req = InvokeRequest::new(id.clone(), kind, payload);
        let line = OutboundFrame::invoke(session_id, &req)
            .and_then(|frame| frame.to_line())
            .map_err(InvokeError::Encode)?;

        let timeout = self.shared.config.request_timeout;
        let (mailbox, deadline) = self.shared.table.register(&id, kind, timeout);
        let sub = Subscription {
            request_id: id,
            kind,
            mailbox,
            deadline,
            timeout,
            session: self.clone(),
            done: false,
        };

        // `shutdown` flips the state before draining the table, so anything
        // registered after the drain is caught here.
        self.ensure_open()?;
        self.write_line(line)?;

        debug!(request_id = %sub.request_id, %kind, session_id = ?session_id, "backwards request sent");
        Ok(sub)
    }

    /// Queue one liveness frame.
    pub fn heartbeat(&self) -> Result<()> {
        self.ensure_open()?;
        let line = OutboundFrame::heartbeat().to_line().map_err(InvokeError::Encode)?;
        self.write_line(line)
    }

    fn write_line(&self, line: String) -> Result<()> {
        if self.shared.outbound.send(line).is_err() {
            self.shared.shutdown("transport writer stopped");
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> InvokeError {
        match &*self.shared.state.borrow() {
            SessionState::Closed(reason) => InvokeError::ConnectionClosed(reason.clone()),
            SessionState::Open => InvokeError::ConnectionClosed("session is shutting down".into()),
        }
    }

    /// Explicit shutdown. Outstanding requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.shared.shutdown("session closed by plugin");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    /// Resolves once the session is closed, with the reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.shared.state.subscribe();
        loop {
            if let SessionState::Closed(reason) = &*rx.borrow_and_update() {
                return reason.clone();
            }
            if rx.changed().await.is_err() {
                return "session dropped".into();
            }
        }
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Number of correlation entries still awaiting a terminal frame.
    pub fn outstanding(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_outstanding(&self, request_id: &str) -> bool {
        self.shared.table.contains(request_id)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

/// The caller's end of one backwards request.
///
/// Frames are pulled one at a time with [`Subscription::recv`]. Dropping the
/// subscription before the terminal frame deregisters the request; late
/// frames for it are then discarded by the dispatcher.
#[derive(Debug)]
pub struct Subscription {
    request_id: RequestId,
    kind: InvokeType,
    mailbox: Arc<Mailbox>,
    deadline: Instant,
    timeout: Duration,
    session: Session,
    done: bool,
}

impl Subscription {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn kind(&self) -> InvokeType {
        self.kind
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next frame payload, `Ok(None)` once the terminal frame was seen.
    ///
    /// After an error the subscription is finished and keeps returning
    /// `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        match tokio::time::timeout_at(self.deadline, self.mailbox.recv()).await {
            Ok(Ok(Received::Frame(value))) => Ok(Some(value)),
            Ok(Ok(Received::End)) => {
                self.finish();
                Ok(None)
            }
            Ok(Err(err)) => {
                self.finish();
                Err(err)
            }
            Err(_elapsed) => {
                self.finish();
                warn!(request_id = %self.request_id, kind = %self.kind, "backwards request timed out");
                Err(InvokeError::Timeout {
                    request_id: self.request_id.clone(),
                    after: self.timeout,
                })
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.session.shared.table.remove(&self.request_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.session.shared.table.remove(&self.request_id) {
            debug!(request_id = %self.request_id, kind = %self.kind, "backwards request abandoned by caller");
        }
    }
}
