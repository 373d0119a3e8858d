//! The two transport tasks of a session.
//!
//! `read_loop` is the only reader of the transport. It decodes one line at a
//! time and routes backwards responses into the correlation table, forwards
//! daemon requests to the inbound channel and periodically sweeps expired
//! entries. `write_loop` is the only writer; callers and the heartbeat hand it
//! complete lines over an unbounded channel so framing never interleaves.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::correlation::Routed;
use crate::error::InvokeError;
use crate::frame::{BackwardsResponse, InboundEvent, InboundFrame};
use crate::session::Shared;

const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(1);
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

// -----------------------------------------------------------------------------
// Writer
// -----------------------------------------------------------------------------

pub(crate) async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut w = BufWriter::new(writer);
    let mut state = shared.state.subscribe();

    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = w.write_all(line.as_bytes()).await {
                    shared.shutdown(format!("transport write failed: {e}"));
                    break;
                }
                if let Err(e) = w.flush().await {
                    shared.shutdown(format!("transport flush failed: {e}"));
                    break;
                }
                trace!(bytes = line.len(), "frame written");
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_closed() {
                    break;
                }
            }
        }
    }

    let _ = w.shutdown().await;
    debug!("writer task stopped");
}

// -----------------------------------------------------------------------------
// Reader / dispatcher
// -----------------------------------------------------------------------------

pub(crate) async fn read_loop<R>(
    reader: R,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    // Holds a partial line across select iterations; `read_until` appends to
    // it, so a losing branch never drops bytes.
    let mut buf = Vec::with_capacity(4096);
    let mut state = shared.state.subscribe();

    let period = shared
        .config
        .request_timeout
        .min(MAX_SWEEP_PERIOD)
        .max(MIN_SWEEP_PERIOD);
    let mut sweep = tokio::time::interval(period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => {
                    if !buf.is_empty() {
                        dispatch_bytes(&shared, &inbound, &buf);
                    }
                    shared.shutdown("transport reached end of stream");
                    break;
                }
                Ok(_) => {
                    dispatch_bytes(&shared, &inbound, &buf);
                    buf.clear();
                }
                Err(e) => {
                    shared.shutdown(format!("transport read failed: {e}"));
                    break;
                }
            },
            _ = sweep.tick() => {
                let swept = shared.table.sweep_expired(Instant::now());
                if swept > 0 {
                    debug!(swept, "expired backwards requests swept");
                }
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_closed() {
                    break;
                }
            }
        }
    }
    debug!("dispatcher task stopped");
}

/// Like [`dispatch_line`] for a raw line off the wire. Lines that are not
/// UTF-8 are dropped.
pub(crate) fn dispatch_bytes(
    shared: &Shared,
    inbound: &mpsc::UnboundedSender<InboundFrame>,
    raw: &[u8],
) {
    match std::str::from_utf8(raw) {
        Ok(line) => dispatch_line(shared, inbound, line),
        Err(e) => warn!(error = %e, len = raw.len(), "discarding non UTF-8 line from daemon"),
    }
}

/// Decode and route a single inbound line. Never fails the session: bad
/// input is logged and, where the request id is recoverable, reported to that
/// request only.
pub(crate) fn dispatch_line(
    shared: &Shared,
    inbound: &mpsc::UnboundedSender<InboundFrame>,
    line: &str,
) {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return;
    }

    let frame = match serde_json::from_str::<InboundFrame>(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "discarding undecodable frame from daemon");
            return;
        }
    };

    match frame.event {
        InboundEvent::BackwardsResponse => route_response(shared, frame.data),
        InboundEvent::Request => {
            if inbound.send(frame).is_err() {
                debug!("no inbound consumer, dropping daemon request");
            }
        }
        InboundEvent::Unknown => debug!("ignoring frame with unknown event"),
    }
}

fn route_response(shared: &Shared, data: Value) {
    let recovered_id = data
        .get("backwards_request_id")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match serde_json::from_value::<BackwardsResponse>(data) {
        Ok(rsp) => {
            let id = rsp.backwards_request_id.clone();
            let routed = shared.table.route(rsp);
            trace!(request_id = %id, ?routed, "backwards response routed");
            if routed == Routed::Orphaned {
                debug!(request_id = %id, "response arrived after request was released");
            }
        }
        Err(e) => match recovered_id {
            Some(id) => {
                warn!(request_id = %id, error = %e, "malformed backwards response");
                shared
                    .table
                    .fail(&id, InvokeError::Protocol(format!("malformed backwards response: {e}")));
            }
            None => warn!(error = %e, "backwards response without request id"),
        },
    }
}
