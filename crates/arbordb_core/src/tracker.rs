//! Tracker of segment identifiers.
//!
//! The tracker interns segment ids: for any `(msb, lsb)` pair it hands out
//! at most one live [`SegmentId`], so callers can rely on pointer identity.
//! The table holds weak references only: retaining an id keeps its mapping
//! alive, but the tracker itself never keeps segment ids (or, indirectly,
//! segment bytes) in memory.
//!
//! The table is split into 32 lock stripes indexed by the low bits of the
//! most significant half, which are uniformly random.

use crate::segment::id::{SegmentIdInner, BULK_BITS, DATA_BITS, LSB_MASK, MSB_MASK};
use crate::segment::{SegmentId, SEGMENT_VERSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Number of lock stripes in the id table.
const STRIPES: usize = 32;

/// Stripe occupancy that triggers a sweep of dead entries.
const CLEANUP_THRESHOLD: usize = 1024;

struct Stripe {
    entries: HashMap<(u64, u64), Weak<SegmentIdInner>>,
    /// Occupancy at which the next dead-entry sweep runs.
    cleanup_at: usize,
}

impl Stripe {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            cleanup_at: CLEANUP_THRESHOLD,
        }
    }

    fn intern(&mut self, msb: u64, lsb: u64) -> SegmentId {
        if let Some(existing) = self.entries.get(&(msb, lsb)).and_then(Weak::upgrade) {
            return SegmentId::from_inner(existing);
        }

        if self.entries.len() >= self.cleanup_at {
            self.entries.retain(|_, weak| weak.strong_count() > 0);
            self.cleanup_at = (self.entries.len() * 2).max(CLEANUP_THRESHOLD);
        }

        let inner = Arc::new(SegmentIdInner { msb, lsb });
        self.entries.insert((msb, lsb), Arc::downgrade(&inner));
        SegmentId::from_inner(inner)
    }
}

/// Identity-preserving factory for segment ids.
pub struct SegmentTracker {
    stripes: Vec<Mutex<Stripe>>,
    /// Number of fresh segment ids created since this tracker was built.
    segment_count: AtomicU64,
}

impl SegmentTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(Stripe::new())).collect(),
            segment_count: AtomicU64::new(0),
        }
    }

    /// Returns the canonical id for the given halves, creating it if this
    /// tracker has not seen the pair before.
    #[must_use]
    pub fn segment_id(&self, msb: u64, lsb: u64) -> SegmentId {
        let stripe = (msb as usize) & (STRIPES - 1);
        self.stripes[stripe].lock().intern(msb, lsb)
    }

    /// Creates and tracks a fresh data segment id.
    #[must_use]
    pub fn new_data_id(&self) -> SegmentId {
        self.new_id(DATA_BITS)
    }

    /// Creates and tracks a fresh bulk segment id.
    #[must_use]
    pub fn new_bulk_id(&self) -> SegmentId {
        self.new_id(BULK_BITS)
    }

    fn new_id(&self, kind: u64) -> SegmentId {
        self.segment_count.fetch_add(1, Ordering::Relaxed);
        let (msb, lsb) = Uuid::new_v4().as_u64_pair();
        let msb = (msb & MSB_MASK) | (u64::from(SEGMENT_VERSION) << 12);
        let lsb = (lsb & LSB_MASK) | kind;
        self.segment_id(msb, lsb)
    }

    /// Returns the number of fresh segment ids created by this tracker.
    #[must_use]
    pub fn segment_count(&self) -> u64 {
        self.segment_count.load(Ordering::Relaxed)
    }

    /// Returns all segment ids that are currently referenced in memory.
    #[must_use]
    pub fn referenced_ids(&self) -> Vec<SegmentId> {
        let mut ids = Vec::new();
        for stripe in &self.stripes {
            let stripe = stripe.lock();
            for weak in stripe.entries.values() {
                if let Some(inner) = weak.upgrade() {
                    ids.push(SegmentId::from_inner(inner));
                }
            }
        }
        ids
    }
}

impl Default for SegmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegmentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTracker")
            .field("segment_count", &self.segment_count())
            .finish_non_exhaustive()
    }
}
