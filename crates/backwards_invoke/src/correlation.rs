use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::InvokeError;
use crate::frame::{BackwardsResponse, Reply, RequestId};
use crate::kind::InvokeType;
use crate::mailbox::Mailbox;

/// Longest wait the runtime schedules. Longer timeouts are clamped so
/// deadline arithmetic cannot overflow `Instant`.
pub(crate) const MAX_WAIT: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `start + wait`, clamped to [`MAX_WAIT`].
pub(crate) fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start + wait.min(MAX_WAIT)
}

/// Outstanding backwards request.
#[derive(Debug)]
struct Entry {
    kind: InvokeType,
    mailbox: Arc<Mailbox>,
    created_at: Instant,
    deadline: Instant,
}

/// Result of routing one response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Delivered,
    /// Delivered and the entry was removed.
    Completed,
    /// No entry for that id (cancelled, expired, or never sent).
    Orphaned,
}

/// Maps in-flight request ids to the mailbox of the caller awaiting them.
///
/// Shard locks are only held for the map operation itself; mailbox work
/// happens on a cloned `Arc` after the lock is released.
#[derive(Debug)]
pub struct CorrelationTable {
    entries: DashMap<RequestId, Entry>,
    queue_capacity: usize,
}

impl CorrelationTable {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            queue_capacity,
        }
    }

    pub(crate) fn register(
        &self,
        id: &str,
        kind: InvokeType,
        timeout: Duration,
    ) -> (Arc<Mailbox>, Instant) {
        let mailbox = Arc::new(Mailbox::new(id, self.queue_capacity));
        let created_at = Instant::now();
        let deadline = deadline_after(created_at, timeout);
        self.entries.insert(
            id.to_owned(),
            Entry {
                kind,
                mailbox: Arc::clone(&mailbox),
                created_at,
                deadline,
            },
        );
        (mailbox, deadline)
    }

    /// Route one response frame to its caller.
    pub(crate) fn route(&self, rsp: BackwardsResponse) -> Routed {
        let id = rsp.backwards_request_id.clone();
        let Some(mailbox) = self.entries.get(&id).map(|e| Arc::clone(&e.mailbox)) else {
            debug!(request_id = %id, event = ?rsp.event, "dropping frame for unknown backwards request");
            return Routed::Orphaned;
        };

        match rsp.into_reply() {
            Reply::Item(data) => {
                mailbox.push(data);
                Routed::Delivered
            }
            Reply::End => {
                mailbox.finish();
                self.complete(&id);
                Routed::Completed
            }
            Reply::Failed(message) => {
                mailbox.fail(InvokeError::Application(message));
                self.complete(&id);
                Routed::Completed
            }
        }
    }

    fn complete(&self, id: &str) {
        if let Some((_, entry)) = self.entries.remove(id) {
            debug!(
                request_id = %id,
                kind = %entry.kind,
                elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                "backwards request completed"
            );
        }
    }

    /// Fail a single outstanding request and drop its entry.
    pub(crate) fn fail(&self, id: &str, err: InvokeError) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                entry.mailbox.fail(err);
                true
            }
            None => false,
        }
    }

    /// Deregister an entry. Returns `true` if it was still outstanding.
    pub(crate) fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail and drop every entry whose deadline has passed.
    pub(crate) fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut swept = 0;
        for id in expired {
            if let Some((_, entry)) = self.entries.remove_if(&id, |_, e| e.deadline <= now) {
                warn!(request_id = %id, kind = %entry.kind, "backwards request expired");
                entry.mailbox.fail(InvokeError::Timeout {
                    request_id: id,
                    after: entry.deadline - entry.created_at,
                });
                swept += 1;
            }
        }
        swept
    }

    /// Resolve every outstanding entry with `err` and empty the table.
    pub(crate) fn fail_all(&self, err: &InvokeError) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.mailbox.fail(err.duplicate());
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }
}
