//! Durable offline queue layered in front of a telemetry send channel.
//!
//! [`OfflineTransport`] wraps an inner [`Transport`] with persistence:
//! envelopes that fail to send are written to an ordered store and retried
//! with exponential backoff, honouring server-directed Retry-After delays.
//! In full-offline mode nothing is transmitted until [`OfflineTransport::flush`]
//! drains the queue head-first.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod envelope;
pub mod queue;
mod retry;
pub mod store;
pub mod transport;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use crate::envelope::{CodecError, EnvelopeCodec, ItemKind};
pub use crate::queue::EnvelopeQueue;
pub use crate::store::{
    EnvelopeStore, MemoryEnvelopeStore, SqliteEnvelopeStore, StoreError, StoreOptions,
};
pub use crate::transport::{
    parse_retry_after, Transport, TransportError, TransportResponse, DEFAULT_RETRY_AFTER,
};

use crate::retry::RetryState;

/// Floor for the opportunistic drain scheduled after a successful live send.
pub const MIN_DELAY: Duration = Duration::from_millis(100);
/// Cooldown after the first failed live send.
pub const START_DELAY: Duration = Duration::from_secs(5);
/// Ceiling for the escalated cooldown.
pub const MAX_DELAY: Duration = Duration::from_secs(3_600);
/// Default hard cap on stored entries.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 30;

/// Item kinds that are never queued: they are order-sensitive or would
/// amplify during an outage.
const UNQUEUEABLE_ITEMS: &[ItemKind] = &[
    ItemKind::ReplayEvent,
    ItemKind::ReplayRecording,
    ItemKind::ClientReport,
];

/// User filter consulted before queueing a failed envelope.
pub type StoreFilter<E> = Arc<dyn Fn(&E, &TransportError, Duration) -> bool + Send + Sync>;

pub struct OfflineTransportOptions<E> {
    /// Arm one opportunistic drain at construction, picking up entries left
    /// over from a previous session.
    pub flush_at_startup: bool,
    /// `send` only enqueues; delivery happens solely through `flush`.
    pub full_offline: bool,
    /// Hard cap on stored entries; inserts beyond it are dropped.
    pub max_queue_size: usize,
    /// Applied after the built-in item-kind exclusion; `None` allows all.
    pub should_store: Option<StoreFilter<E>>,
}

impl<E> Default for OfflineTransportOptions<E> {
    fn default() -> Self {
        Self {
            flush_at_startup: false,
            full_offline: false,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            should_store: None,
        }
    }
}

impl<E> Clone for OfflineTransportOptions<E> {
    fn clone(&self) -> Self {
        Self {
            flush_at_startup: self.flush_at_startup,
            full_offline: self.full_offline,
            max_queue_size: self.max_queue_size,
            should_store: self.should_store.clone(),
        }
    }
}

impl<E> fmt::Debug for OfflineTransportOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineTransportOptions")
            .field("flush_at_startup", &self.flush_at_startup)
            .field("full_offline", &self.full_offline)
            .field("max_queue_size", &self.max_queue_size)
            .field("should_store", &self.should_store.as_ref().map(|_| "filter"))
            .finish()
    }
}

impl<E> OfflineTransportOptions<E> {
    #[must_use]
    pub fn with_flush_at_startup(mut self) -> Self {
        self.flush_at_startup = true;
        self
    }

    #[must_use]
    pub fn with_full_offline(mut self) -> Self {
        self.full_offline = true;
        self
    }

    #[must_use]
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    #[must_use]
    pub fn with_should_store(
        mut self,
        filter: impl Fn(&E, &TransportError, Duration) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_store = Some(Arc::new(filter));
        self
    }
}

/// Offline-capable wrapper around an inner transport.
///
/// Live sends go straight through; failures land in the durable queue and
/// are retried on a single backoff timer. After every successful live send
/// one queued envelope is opportunistically drained. Construction hands back
/// an [`Arc`] because the drain timers hold a weak reference to the engine;
/// dropping the last handle abandons any pending timer.
pub struct OfflineTransport<T, C>
where
    C: EnvelopeCodec,
    T: Transport<C::Envelope>,
{
    inner: T,
    codec: Arc<C>,
    queue: Option<EnvelopeQueue<C>>,
    state: Mutex<RetryState>,
    options: OfflineTransportOptions<C::Envelope>,
}

impl<T, C> OfflineTransport<T, C>
where
    C: EnvelopeCodec,
    T: Transport<C::Envelope>,
{
    fn lock_state<R>(&self, f: impl FnOnce(&mut RetryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn should_queue(
        &self,
        envelope: &C::Envelope,
        error: &TransportError,
        retry_delay: Duration,
    ) -> bool {
        if self.codec.contains_item_kind(envelope, UNQUEUEABLE_ITEMS) {
            return false;
        }
        match &self.options.should_store {
            Some(filter) => filter(envelope, error, retry_delay),
            None => true,
        }
    }

    /// Cancels any pending drain timer. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.lock_state(RetryState::cancel_timer);
    }

    #[cfg(test)]
    fn current_retry_delay(&self) -> Duration {
        self.lock_state(|state| state.delay())
    }

    #[cfg(test)]
    fn timer_armed(&self) -> bool {
        self.lock_state(|state| state.timer_armed())
    }
}

impl<T, C> OfflineTransport<T, C>
where
    C: EnvelopeCodec + 'static,
    T: Transport<C::Envelope> + 'static,
{
    /// Wraps `inner` with durable queueing.
    ///
    /// Without a store, queueing is disabled and failures surface directly.
    /// Must be called from within a tokio runtime: drains are driven by
    /// spawned timers.
    pub fn new(
        inner: T,
        codec: Arc<C>,
        store: Option<Arc<dyn EnvelopeStore>>,
        options: OfflineTransportOptions<C::Envelope>,
    ) -> Arc<Self> {
        let queue =
            store.map(|store| EnvelopeQueue::new(store, Arc::clone(&codec), options.max_queue_size));
        let transport = Arc::new(Self {
            inner,
            codec,
            queue,
            state: Mutex::new(RetryState::new()),
            options,
        });
        if transport.options.flush_at_startup {
            let _ = transport.flush_with_backoff(false);
        }
        transport
    }

    /// Attempts live delivery of `envelope`.
    ///
    /// A queued failure resolves with an empty response; the original error
    /// is returned only when the store is absent or the filter refuses it.
    pub async fn send(
        self: &Arc<Self>,
        envelope: C::Envelope,
    ) -> Result<TransportResponse, TransportError> {
        self.send_inner(envelope, false).await
    }

    /// In full-offline mode starts a head drain of everything currently
    /// queued (`false` if one is already running); otherwise defers to the
    /// inner transport.
    pub async fn flush(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<bool, TransportError> {
        if !self.options.full_offline {
            return self.inner.flush(timeout).await;
        }
        let Some(queue) = &self.queue else {
            return Ok(true);
        };
        if self.lock_state(|state| state.head_drain_active()) {
            debug!("drain already in progress");
            return Ok(false);
        }
        let size = match queue.size().await {
            Ok(size) => size,
            Err(error) => {
                warn!(%error, "failed to read queue size, drain not started");
                return Ok(false);
            }
        };
        if size > 0 {
            debug!(size, "starting head drain");
            self.lock_state(|state| state.begin_head_drain(size));
            let _ = self.flush_with_backoff(true);
        }
        Ok(true)
    }

    /// Discards everything currently queued.
    pub async fn purge(&self) -> Result<bool, TransportError> {
        if let Some(queue) = &self.queue {
            if let Err(error) = queue.clear().await {
                warn!(%error, "failed to clear queue");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn send_inner(
        self: &Arc<Self>,
        envelope: C::Envelope,
        is_flushing_head: bool,
    ) -> Result<TransportResponse, TransportError> {
        if self.options.full_offline && !is_flushing_head {
            if let Some(queue) = &self.queue {
                debug!("full offline mode, queueing envelope");
                if let Err(store_error) = queue.insert(&envelope, false).await {
                    warn!(%store_error, "failed to queue envelope");
                }
                return Ok(TransportResponse::default());
            }
        }

        match self.inner.send(&envelope).await {
            Ok(response) => {
                let mut delay = MIN_DELAY;
                if let Some(header) = response.retry_after() {
                    delay = parse_retry_after(header, SystemTime::now());
                } else if response.status_code.unwrap_or(0) >= 400 {
                    // Server error: the queue is not advanced.
                    return Ok(response);
                }
                self.lock_state(RetryState::reset_delay);
                if is_flushing_head {
                    if let Some(step) = self.flush_in(delay, true) {
                        let _ = step.await;
                    }
                } else {
                    let _ = self.flush_in(delay, false);
                }
                Ok(response)
            }
            Err(error) => {
                let retry_delay = self.lock_state(RetryState::escalate);
                if let Some(queue) = &self.queue {
                    if self.should_queue(&envelope, &error, retry_delay) {
                        if is_flushing_head {
                            // Keep the envelope's position for the retry.
                            if let Err(store_error) = queue.insert(&envelope, true).await {
                                warn!(%store_error, "failed to requeue envelope at head");
                            }
                            self.lock_state(RetryState::record_requeued);
                            if let Some(step) = self.flush_with_backoff(true) {
                                let _ = step.await;
                            }
                        } else {
                            if let Err(store_error) = queue.insert(&envelope, false).await {
                                warn!(%store_error, "failed to queue envelope");
                            }
                            let _ = self.flush_with_backoff(false);
                        }
                        debug!(%error, "error sending, envelope queued");
                        return Ok(TransportResponse::default());
                    }
                }
                Err(error)
            }
        }
    }

    /// Arms the drain timer, replacing any pending one (latest wins).
    ///
    /// Returns the timer task so a head drain can await it and step
    /// sequentially; opportunistic callers let it run detached.
    fn flush_in(self: &Arc<Self>, delay: Duration, is_flushing_head: bool) -> Option<JoinHandle<()>> {
        self.queue.as_ref()?;
        let engine = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = Weak::upgrade(&engine) else {
                return;
            };
            engine.drain_step(is_flushing_head).await;
        });
        self.lock_state(|state| state.arm_timer(handle.abort_handle()));
        Some(handle)
    }

    /// Schedules a drain at the current cooldown unless one is already
    /// pending (at most one retry pipeline in flight).
    fn flush_with_backoff(self: &Arc<Self>, is_flushing_head: bool) -> Option<JoinHandle<()>> {
        let delay = self.lock_state(|state| {
            if state.timer_armed() {
                None
            } else {
                Some(state.delay())
            }
        })?;
        self.flush_in(delay, is_flushing_head)
    }

    /// Timer callback: pop one envelope and feed it back through the send
    /// path with the head flag it was armed with.
    async fn drain_step(self: Arc<Self>, is_flushing_head: bool) {
        let (offset, can_pop) = self.lock_state(|state| {
            state.clear_timer();
            if is_flushing_head {
                (0, state.window_open())
            } else {
                (state.pending_offset(), true)
            }
        });
        if !can_pop {
            // Window exhausted: the head drain is complete.
            self.lock_state(RetryState::end_head_drain);
            return;
        }
        let Some(queue) = &self.queue else { return };
        match queue.pop(offset).await {
            Ok(Some(envelope)) => {
                if is_flushing_head {
                    self.lock_state(RetryState::record_popped);
                }
                debug!("attempting to send previously queued envelope");
                if let Err(error) = self.send_inner(envelope, is_flushing_head).await {
                    debug!(%error, "error sending queued envelope");
                }
            }
            Ok(None) => {
                if is_flushing_head {
                    self.lock_state(RetryState::end_head_drain);
                }
            }
            Err(error) => {
                warn!(%error, "failed to pop queued envelope");
                if is_flushing_head {
                    self.lock_state(RetryState::end_head_drain);
                }
            }
        }
    }
}

impl<T, C> Drop for OfflineTransport<T, C>
where
    C: EnvelopeCodec,
    T: Transport<C::Envelope>,
{
    fn drop(&mut self) {
        self.close();
    }
}
