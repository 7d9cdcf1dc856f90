//! Allocation event stream.
//!
//! The profiling transport is an external collaborator; the core's whole
//! obligation is "record alloc/free event with callstack id". A consumer
//! installs an [`EventSink`] and, optionally, a callstack provider; the
//! dispatcher then emits one record per allocation and free. With no sink
//! installed the hot paths skip event construction entirely.

use crate::stats::TierKind;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque callstack handle supplied by the embedding application.
/// Zero means "no callstack captured".
pub type CallstackId = u64;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Alloc,
    Free,
}

/// One allocation lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocEvent {
    /// Monotonic event sequence number.
    pub sequence: u64,
    pub kind: EventKind,
    /// User pointer address.
    pub addr: usize,
    /// Tier-rounded size in bytes. Zero for frees where the size was
    /// not resolved (never the case for pointers this heap owns).
    pub size: usize,
    pub tier: TierKind,
    pub callstack: CallstackId,
}

/// Consumer of the event stream. Called on the allocation paths;
/// implementations must be cheap and must not re-enter the heap.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &AllocEvent);
}

/// Provides callstack ids for events; capture and symbolization live
/// outside the core.
pub trait CallstackProvider: Send + Sync {
    fn current(&self) -> CallstackId;
}

/// Sequence counter shared by all tiers of one heap.
#[derive(Debug, Default)]
pub struct EventSequence(AtomicU64);

impl EventSequence {
    #[must_use]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A sink that retains every event; test and harness use.
#[derive(Default)]
pub struct VecSink {
    events: parking_lot::Mutex<Vec<AllocEvent>>,
}

impl VecSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn drain(&self) -> Vec<AllocEvent> {
        std::mem::take(&mut self.events.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for VecSink {
    fn record(&self, event: &AllocEvent) {
        self.events.lock().push(*event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let seq = EventSequence::default();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }

    #[test]
    fn vec_sink_retains_events() {
        let sink = VecSink::new();
        sink.record(&AllocEvent {
            sequence: 0,
            kind: EventKind::Alloc,
            addr: 0x1000,
            size: 64,
            tier: TierKind::FsaSmall,
            callstack: 7,
        });
        assert_eq!(sink.len(), 1);
        let drained = sink.drain();
        assert_eq!(drained[0].callstack, 7);
        assert!(sink.is_empty());
    }
}
