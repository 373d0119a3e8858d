//! Per-request delivery queue written by the dispatcher and read by exactly
//! one consumer.
//!
//! The queue is bounded and never makes the writer wait: pushing into a full
//! mailbox evicts the oldest undelivered frame and bumps a lag counter. The
//! consumer sees the lag as [`InvokeError::Lagged`] and its stream ends, so a
//! stream is either complete and in order or finishes with an error. The
//! terminal outcome is kept outside the frame buffer and is never evicted.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::InvokeError;

/// What the consumer gets on each pull.
#[derive(Debug)]
pub enum Received {
    Frame(Value),
    /// Terminal frame seen; nothing more will arrive.
    End,
}

#[derive(Debug)]
enum Closure {
    End,
    Failed(InvokeError),
}

#[derive(Debug)]
struct State {
    frames: VecDeque<Value>,
    lagged: u64,
    closed: Option<Closure>,
}

#[derive(Debug)]
pub(crate) struct Mailbox {
    request_id: String,
    capacity: usize,
    state: Mutex<State>,
    notify: Notify,
}

impl Mailbox {
    pub(crate) fn new(request_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            request_id: request_id.into(),
            capacity: capacity.max(1),
            state: Mutex::new(State {
                frames: VecDeque::new(),
                lagged: 0,
                closed: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue a frame. Returns `false` if the mailbox is already closed and
    /// the frame was discarded.
    pub(crate) fn push(&self, frame: Value) -> bool {
        {
            let mut st = self.state.lock();
            if st.closed.is_some() {
                return false;
            }
            if st.frames.len() >= self.capacity {
                st.frames.pop_front();
                st.lagged += 1;
            }
            st.frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Mark the stream complete. Frames already queued stay deliverable.
    pub(crate) fn finish(&self) {
        self.close_with(Closure::End);
    }

    /// Fail the stream. Frames already queued are still delivered first.
    pub(crate) fn fail(&self, err: InvokeError) {
        self.close_with(Closure::Failed(err));
    }

    fn close_with(&self, closure: Closure) {
        {
            let mut st = self.state.lock();
            if st.closed.is_some() {
                return;
            }
            st.closed = Some(closure);
        }
        self.notify.notify_one();
    }

    /// Number of frames waiting for the consumer.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Pull the next frame, waiting for the dispatcher if nothing is queued.
    ///
    /// Must only be called from the single consumer of this mailbox.
    pub(crate) async fn recv(&self) -> Result<Received, InvokeError> {
        loop {
            if let Some(out) = self.try_take() {
                return out;
            }
            // `notify_one` stores a permit when nobody is waiting, so a push
            // racing with this line is not lost.
            self.notify.notified().await;
        }
    }

    fn try_take(&self) -> Option<Result<Received, InvokeError>> {
        let mut st = self.state.lock();
        if st.lagged > 0 {
            let skipped = std::mem::take(&mut st.lagged);
            st.frames.clear();
            st.closed = Some(Closure::End);
            return Some(Err(InvokeError::Lagged {
                request_id: self.request_id.clone(),
                skipped,
            }));
        }
        if let Some(frame) = st.frames.pop_front() {
            return Some(Ok(Received::Frame(frame)));
        }
        match &st.closed {
            Some(Closure::End) => Some(Ok(Received::End)),
            Some(Closure::Failed(err)) => Some(Err(err.duplicate())),
            None => None,
        }
    }
}
