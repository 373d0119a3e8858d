//! Per-object guard for timed invocations.
//!
//! A model wrapper owns one [`TimingContext`]. Each timed call enters it,
//! which records the start instant; finishing (or dropping) the guard resets
//! it. Entering while another call on the same object is still running is a
//! programming error and fails right away with [`InvokeError::Race`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{InvokeError, Result};

/// Clones share one state: they are the same owning object.
#[derive(Debug, Clone, Default)]
pub struct TimingContext {
    started_at: Arc<Mutex<Option<Instant>>>,
}

impl TimingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> Running. Never waits.
    pub fn enter(&self) -> Result<TimingGuard> {
        let mut slot = self.started_at.lock();
        if slot.is_some() {
            return Err(InvokeError::Race);
        }
        let now = Instant::now();
        *slot = Some(now);
        Ok(TimingGuard {
            ctx: self.clone(),
            started_at: now,
            finished: false,
        })
    }

    pub fn is_running(&self) -> bool {
        self.started_at.lock().is_some()
    }

    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock()
    }

    fn reset(&self) {
        *self.started_at.lock() = None;
    }
}

/// Held for the duration of one timed invocation.
#[derive(Debug)]
#[must_use = "dropping the guard ends the timed section"]
pub struct TimingGuard {
    ctx: TimingContext,
    started_at: Instant,
    finished: bool,
}

impl TimingGuard {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Running -> Idle, returning the wall time spent.
    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let elapsed = self.started_at.elapsed();
        self.ctx.reset();
        elapsed
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.ctx.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_a_race() {
        let ctx = TimingContext::new();
        let guard = ctx.enter().unwrap();
        assert!(matches!(ctx.enter(), Err(InvokeError::Race)));
        assert!(matches!(ctx.clone().enter(), Err(InvokeError::Race)));
        guard.finish();
        assert!(ctx.enter().is_ok());
    }

    #[test]
    fn drop_resets_state() {
        let ctx = TimingContext::new();
        {
            let _g = ctx.enter().unwrap();
            assert!(ctx.is_running());
        }
        assert!(!ctx.is_running());
        assert_eq!(ctx.started_at(), None);
    }

    #[test]
    fn finish_reports_elapsed() {
        let ctx = TimingContext::new();
        let g = ctx.enter().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let took = g.finish();
        assert!(took >= Duration::from_millis(10));
        assert_eq!(ctx.started_at(), None);
    }
}
