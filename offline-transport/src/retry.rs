use std::time::Duration;

use tokio::task::AbortHandle;

use crate::{MAX_DELAY, START_DELAY};

/// Backoff and drain bookkeeping owned by the engine.
///
/// One instance per engine, mutated only between suspension points. The
/// window counters (`size_to_flush`, `flushed_count`) bound a head drain so
/// it terminates even while new inserts land at the tail.
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    delay: Duration,
    size_to_flush: usize,
    flushed_count: usize,
    timer: Option<AbortHandle>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current cooldown before the next drain attempt.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Escalates the cooldown after a failed live send and returns it.
    ///
    /// Yields exactly `START_DELAY` on the first failure, doubles on each
    /// consecutive one, and clamps at `MAX_DELAY`.
    pub fn escalate(&mut self) -> Duration {
        self.delay = self.delay.saturating_mul(2).min(MAX_DELAY).max(START_DELAY);
        self.delay
    }

    /// Clears the cooldown after a successful live send.
    pub fn reset_delay(&mut self) {
        self.delay = Duration::ZERO;
    }

    pub fn head_drain_active(&self) -> bool {
        self.size_to_flush > 0
    }

    pub fn begin_head_drain(&mut self, size: usize) {
        self.size_to_flush = size;
        self.flushed_count = 0;
    }

    pub fn end_head_drain(&mut self) {
        self.size_to_flush = 0;
        self.flushed_count = 0;
    }

    /// True while the current head-drain window still has entries to pop.
    pub fn window_open(&self) -> bool {
        self.flushed_count < self.size_to_flush
    }

    pub fn record_popped(&mut self) {
        self.flushed_count += 1;
    }

    /// A failed head send put its envelope back at the head; step the
    /// window back so the retry re-reads the same logical slot.
    pub fn record_requeued(&mut self) {
        self.flushed_count = self.flushed_count.saturating_sub(1);
    }

    /// Offset opportunistic pops use so they never steal entries from an
    /// in-progress head-drain window.
    pub fn pending_offset(&self) -> usize {
        self.size_to_flush.saturating_sub(self.flushed_count)
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Installs a new timer, cancelling any pending one (latest wins).
    pub fn arm_timer(&mut self, handle: AbortHandle) {
        if let Some(previous) = self.timer.replace(handle) {
            previous.abort();
        }
    }

    pub fn clear_timer(&mut self) {
        self.timer = None;
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
