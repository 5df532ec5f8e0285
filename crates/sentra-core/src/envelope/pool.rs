//! Reusable envelope storage. High event rates would otherwise allocate a
//! fresh envelope for every sensor line; the pool keeps retired envelopes
//! around and hands them back out with the reference count cleared.

use super::{Envelope, PoolTag, SharedEnvelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Availability-indexed store of idle envelopes.
///
/// Contract: only an envelope whose reference count reached zero is ever
/// returned, and a returned envelope is written to only after it has been
/// re-acquired. Acquisition hands out exclusive ownership, so the second
/// half is enforced by the type system.
#[derive(Debug, Default)]
pub struct EnvelopePool {
    idle: Mutex<Vec<Box<Envelope>>>,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

impl EnvelopePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hand out an exclusively-owned envelope with the reference count
    /// reset to zero. The caller reinitializes the record before sharing,
    /// so no residual data from a prior use survives the cycle.
    pub fn acquire(&self) -> Box<Envelope> {
        let recycled = self.idle.lock().expect("pool lock poisoned").pop();
        match recycled {
            Some(mut envelope) => {
                envelope.reset();
                envelope
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::new(Envelope::default())
            }
        }
    }

    /// Convert an exclusively-owned envelope into the shared form that
    /// crosses worker boundaries.
    pub fn share(envelope: Box<Envelope>) -> SharedEnvelope {
        envelope.set_tag(PoolTag::InFlight);
        Arc::from(envelope)
    }

    /// Terminal disposition: drop one reference. The caller that observes
    /// the transition to zero returns the envelope to the pool.
    pub fn release(&self, envelope: SharedEnvelope) {
        if envelope.release() {
            self.recycle(envelope);
        }
    }

    /// Return a shared envelope whose reference count is already zero
    /// (filter drops, records that never gained a downstream).
    pub fn recycle(&self, envelope: SharedEnvelope) {
        debug_assert_eq!(envelope.ref_count(), 0);
        match Arc::try_unwrap(envelope) {
            Ok(envelope) => self.give_back(Box::new(envelope)),
            Err(stale) => {
                // Another handle is still mid-release; let that allocation
                // retire instead of racing for it.
                trace!(handles = Arc::strong_count(&stale), "envelope not reclaimed");
            }
        }
    }

    /// Return an envelope that was never shared (parse failures).
    pub fn give_back(&self, envelope: Box<Envelope>) {
        envelope.set_tag(PoolTag::Recycled);
        self.recycled.fetch_add(1, Ordering::Relaxed);
        self.idle.lock().expect("pool lock poisoned").push(envelope);
    }

    /// Number of envelopes currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().expect("pool lock poisoned").len()
    }

    /// Envelopes allocated fresh over the pool's lifetime.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Envelopes returned to the pool over its lifetime.
    pub fn recycled(&self) -> u64 {
        self.recycled.load(Ordering::Relaxed)
    }
}
