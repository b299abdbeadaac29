use std::sync::Arc;

use tracing::warn;

use crate::envelope::EnvelopeCodec;
use crate::store::{EnvelopeStore, StoreError};

/// Envelope-level facade over the durable store.
///
/// Serialization and parse failures are swallowed here: this is a
/// best-effort channel, and a payload the codec cannot round-trip is not
/// worth failing a caller over. Store failures pass through for the engine
/// to absorb in its retry path.
pub struct EnvelopeQueue<C: EnvelopeCodec> {
    store: Arc<dyn EnvelopeStore>,
    codec: Arc<C>,
    max_size: usize,
}

impl<C: EnvelopeCodec> EnvelopeQueue<C> {
    pub fn new(store: Arc<dyn EnvelopeStore>, codec: Arc<C>, max_size: usize) -> Self {
        Self {
            store,
            codec,
            max_size,
        }
    }

    /// Serializes and stores an envelope, at the head when `to_start`.
    pub async fn insert(&self, envelope: &C::Envelope, to_start: bool) -> Result<(), StoreError> {
        let bytes = match self.codec.serialize(envelope) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "failed to serialize envelope, dropping");
                return Ok(());
            }
        };
        self.store.insert(&bytes, self.max_size, to_start).await
    }

    /// Removes and parses the envelope `offset` positions from the head.
    ///
    /// An entry the codec cannot parse back has already been deleted by the
    /// time the failure surfaces; it is logged and reported as absent.
    pub async fn pop(&self, offset: usize) -> Result<Option<C::Envelope>, StoreError> {
        let Some(bytes) = self.store.pop(offset).await? else {
            return Ok(None);
        };
        match self.codec.parse(&bytes) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(error) => {
                warn!(%error, "failed to parse queued envelope, entry lost");
                Ok(None)
            }
        }
    }

    pub async fn size(&self) -> Result<usize, StoreError> {
        self.store.size().await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }
}
