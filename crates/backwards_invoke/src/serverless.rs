//! Backwards invocation for serverless installs.
//!
//! A serverless plugin has no duplex stream to the daemon. Each backwards
//! request is its own HTTP transaction instead: the same `session` frame a
//! duplex [`Session`](crate::Session) would write is POSTed to
//! `{daemon_url}/backwards-invocation/transaction`, and the response body
//! carries that request's `backwards_response` frames, one per line.
//!
//! The POST is issued when [`HttpInvoker::send`] is called; the body is read
//! as the caller pulls from [`HttpReplies`].

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, Url};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::correlation::deadline_after;
use crate::error::{InvokeError, Result};
use crate::frame::{BackwardsResponse, InboundEvent, InboundFrame, InvokeRequest, OutboundFrame, Reply, RequestId};
use crate::kind::InvokeType;
use crate::transport::TransportError;

pub const TRANSACTION_PATH: &str = "backwards-invocation/transaction";
pub const SESSION_ID_HEADER: &str = "Dify-Plugin-Session-ID";

/// Issues backwards requests over HTTP. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: Client,
    endpoint: Url,
    request_timeout: Duration,
}

impl HttpInvoker {
    pub fn new(daemon_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let raw = format!("{}/{TRANSACTION_PATH}", daemon_url.trim_end_matches('/'));
        let endpoint = Url::parse(&raw).map_err(|e| TransportError::InvalidUrl {
            url: daemon_url.to_owned(),
            reason: e.to_string(),
        })?;
        let client = Client::builder().build().map_err(TransportError::HttpClient)?;
        Ok(Self {
            client,
            endpoint,
            request_timeout,
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, TransportError> {
        Self::new(&config.plugin_daemon_url, config.max_request_timeout)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// POST one backwards request and return the handle for its replies.
    /// Must be called inside a tokio runtime.
    pub fn send(&self, session_id: Option<&str>, kind: InvokeType, payload: Value) -> Result<HttpReplies> {
        let id: RequestId = Uuid::new_v4().simple().to_string();
        let req = InvokeRequest::new(id.clone(), kind, payload);
        let body = OutboundFrame::invoke(session_id, &req)
            .and_then(|frame| frame.to_line())
            .map_err(InvokeError::Encode)?;

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(sid) = session_id {
            builder = builder.header(SESSION_ID_HEADER, sid);
        }
        let pending = tokio::spawn(builder.send());

        debug!(request_id = %id, %kind, session_id = ?session_id, url = %self.endpoint, "backwards request posted");
        Ok(HttpReplies {
            request_id: id,
            kind,
            state: ReplyState::Pending(pending),
            buf: Vec::new(),
            deadline: deadline_after(Instant::now(), self.request_timeout),
            timeout: self.request_timeout,
            done: false,
        })
    }
}

#[derive(Debug)]
enum ReplyState {
    Pending(JoinHandle<reqwest::Result<Response>>),
    Body(Response),
    Drained,
}

/// The caller's end of one HTTP backwards request. Dropping it before the
/// terminal frame abandons the transaction.
#[derive(Debug)]
pub struct HttpReplies {
    request_id: RequestId,
    kind: InvokeType,
    state: ReplyState,
    buf: Vec<u8>,
    deadline: Instant,
    timeout: Duration,
    done: bool,
}

impl HttpReplies {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn kind(&self) -> InvokeType {
        self.kind
    }

    /// Next frame payload, `Ok(None)` once the terminal frame was seen or the
    /// body ended. After an error the replies are finished.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        let outcome = match tokio::time::timeout_at(self.deadline, self.next_payload()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                warn!(request_id = %self.request_id, kind = %self.kind, "backwards request timed out");
                Err(InvokeError::Timeout {
                    request_id: self.request_id.clone(),
                    after: self.timeout,
                })
            }
        };
        if !matches!(outcome, Ok(Some(_))) {
            self.done = true;
            self.release();
        }
        outcome
    }

    async fn next_payload(&mut self) -> Result<Option<Value>> {
        while let Some(line) = self.next_line().await? {
            let text = std::str::from_utf8(&line)
                .map_err(|e| self.protocol(format!("non UTF-8 line: {e}")))?
                .trim();
            if text.is_empty() {
                continue;
            }
            let frame: InboundFrame =
                serde_json::from_str(text).map_err(|e| self.protocol(format!("undecodable frame: {e}")))?;
            if frame.event != InboundEvent::BackwardsResponse {
                debug!(request_id = %self.request_id, event = ?frame.event, "skipping non-response frame");
                continue;
            }
            let rsp: BackwardsResponse = serde_json::from_value(frame.data)
                .map_err(|e| self.protocol(format!("malformed backwards response: {e}")))?;
            trace!(request_id = %self.request_id, event = ?rsp.event, "backwards response received");
            return match rsp.into_reply() {
                Reply::Item(data) => Ok(Some(data)),
                Reply::End => Ok(None),
                Reply::Failed(message) => Err(InvokeError::Application(message)),
            };
        }
        Ok(None)
    }

    /// Next `\n`-terminated line of the body. A trailing line without a
    /// newline is returned when the body ends.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let rest = self.buf.split_off(pos + 1);
                return Ok(Some(std::mem::replace(&mut self.buf, rest)));
            }
            if matches!(self.state, ReplyState::Pending(_)) {
                self.connect().await?;
            }
            let read = match &mut self.state {
                ReplyState::Pending(_) => continue,
                ReplyState::Body(response) => response.chunk().await,
                ReplyState::Drained => return Ok(None),
            };
            match read {
                Ok(Some(chunk)) => self.buf.extend_from_slice(&chunk),
                Ok(None) => {
                    self.state = ReplyState::Drained;
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(std::mem::take(&mut self.buf)));
                }
                Err(e) => return Err(self.http_failed(&e)),
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        let ReplyState::Pending(handle) = &mut self.state else {
            return Ok(());
        };
        let response = match handle.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.http_failed(&e)),
            Err(e) => {
                return Err(InvokeError::ConnectionClosed(format!(
                    "backwards request {} aborted: {e}",
                    self.request_id
                )));
            }
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.protocol(format!("daemon answered {status}: {body}")));
        }
        self.state = ReplyState::Body(response);
        Ok(())
    }

    fn release(&mut self) {
        if let ReplyState::Pending(handle) = std::mem::replace(&mut self.state, ReplyState::Drained) {
            handle.abort();
        }
    }

    fn protocol(&self, what: String) -> InvokeError {
        InvokeError::Protocol(format!("backwards request {}: {what}", self.request_id))
    }

    fn http_failed(&self, e: &reqwest::Error) -> InvokeError {
        InvokeError::ConnectionClosed(format!("backwards request {} over http failed: {e}", self.request_id))
    }
}

impl Drop for HttpReplies {
    fn drop(&mut self) {
        if !self.done {
            debug!(request_id = %self.request_id, kind = %self.kind, "http backwards request abandoned by caller");
        }
        self.release();
    }
}
