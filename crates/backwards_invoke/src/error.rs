use std::time::Duration;

use thiserror::Error;

use crate::kind::InvokeType;

/// Coarse classification of an [`InvokeError`].
///
/// Callers that only need to decide "retry, give up, or fix the caller" can
/// match on this instead of on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport closed or errored. Fatal to the session.
    Connection,
    /// No terminal frame within the request timeout.
    Timeout,
    /// A frame could not be decoded or a required field was missing.
    Protocol,
    /// An operation expected at least one reply frame and got none.
    NotFound,
    /// Well-formed reply reporting that the remote operation failed.
    Application,
    /// The caller broke a usage contract (e.g. concurrent timed invocation).
    ContractViolation,
}

/// Errors surfaced to the consumer of a backwards invocation.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The transport to the daemon is gone; every outstanding call fails with this.
    #[error("connection to plugin daemon closed: {0}")]
    ConnectionClosed(String),

    /// The request saw no terminal frame before its deadline.
    #[error("backwards request {request_id} timed out after {} ms", after.as_millis())]
    Timeout { request_id: String, after: Duration },

    /// A response frame could not be decoded into the expected element type.
    #[error("failed to decode response for {request_id}: {source}")]
    Decode {
        request_id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The request payload could not be serialised.
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// Reply was well formed JSON but violated the protocol for this call.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The consumer fell behind and frames were evicted from its mailbox.
    #[error("backwards request {request_id} lagged, {skipped} frame(s) dropped")]
    Lagged { request_id: String, skipped: u64 },

    /// The key (or resource) does not exist on the daemon side.
    #[error("not found: {0}")]
    NotFound(String),

    /// A single-result call completed without producing any element.
    #[error("no response received for {kind} invocation")]
    NoResponse { kind: InvokeType },

    /// The daemon reported a failure of the remote operation itself.
    #[error("remote operation failed: {0}")]
    Application(String),

    /// A timed invocation was entered while another one is still running on
    /// the same owning object.
    #[error("race condition: timed invocation entered while another one is running on the same object")]
    Race,
}

impl InvokeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvokeError::ConnectionClosed(_) => ErrorKind::Connection,
            InvokeError::Timeout { .. } => ErrorKind::Timeout,
            InvokeError::Decode { .. }
            | InvokeError::Encode(_)
            | InvokeError::Protocol(_)
            | InvokeError::Lagged { .. } => ErrorKind::Protocol,
            InvokeError::NotFound(_) | InvokeError::NoResponse { .. } => ErrorKind::NotFound,
            InvokeError::Application(_) => ErrorKind::Application,
            InvokeError::Race => ErrorKind::ContractViolation,
        }
    }

    /// Rebuilds an equivalent error so one failure can be fanned out to many
    /// waiting streams. `serde_json::Error` is not `Clone`, so decode/encode
    /// failures are folded into [`InvokeError::Protocol`].
    pub(crate) fn duplicate(&self) -> InvokeError {
        match self {
            InvokeError::ConnectionClosed(reason) => InvokeError::ConnectionClosed(reason.clone()),
            InvokeError::Timeout { request_id, after } => InvokeError::Timeout {
                request_id: request_id.clone(),
                after: *after,
            },
            InvokeError::Decode { .. } | InvokeError::Encode(_) => {
                InvokeError::Protocol(self.to_string())
            }
            InvokeError::Protocol(msg) => InvokeError::Protocol(msg.clone()),
            InvokeError::Lagged { request_id, skipped } => InvokeError::Lagged {
                request_id: request_id.clone(),
                skipped: *skipped,
            },
            InvokeError::NotFound(what) => InvokeError::NotFound(what.clone()),
            InvokeError::NoResponse { kind } => InvokeError::NoResponse { kind: *kind },
            InvokeError::Application(msg) => InvokeError::Application(msg.clone()),
            InvokeError::Race => InvokeError::Race,
        }
    }
}

pub type Result<T, E = InvokeError> = std::result::Result<T, E>;
