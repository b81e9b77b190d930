//! Bounded ring buffer of preallocated events.
//!
//! One producer fills slots, a pool of symmetric workers each claims one
//! published event and runs the processor graph on it. Besides the claiming
//! worker, other parties (the shared-memory server, the latest-view reader)
//! can hold references on a slot; the slot returns to the free list only
//! once every reference is gone.
//!
//! Events inside slots sit behind an `RwLock`: the producer takes the write
//! side while filling, everyone after publication reads.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use log::warn;

use crate::event::CassEvent;

/// Sequence number of a published event, used to address its slot from
/// outside the worker path.
pub type Sequence = u64;

struct Slot {
    event: Arc<RwLock<CassEvent>>,
    seq: Sequence,
    /// Outstanding references: the claiming worker plus any retains.
    refs: usize,
    is_latest: bool,
    published: bool,
}

struct Inner {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    ready: VecDeque<usize>,
    by_seq: HashMap<Sequence, usize>,
    next_seq: Sequence,
    latest: Option<usize>,
    end_of_stream: bool,
}

impl Inner {
    fn maybe_reclaim(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.published && slot.refs == 0 && !slot.is_latest {
            slot.published = false;
            self.by_seq.remove(&slot.seq);
            self.free.push_back(index);
        }
    }
}

/// A slot checked out for filling. Hand it back with
/// [`RingBuffer::done_filling`].
pub struct FillHandle {
    index: usize,
    /// The event to decode into.
    pub event: Arc<RwLock<CassEvent>>,
}

/// A published event claimed by a worker. Hand it back with
/// [`RingBuffer::done_processing`].
pub struct ProcessHandle {
    index: usize,
    /// Sequence number of the claimed event.
    pub seq: Sequence,
    /// The claimed event, read-only.
    pub event: Arc<RwLock<CassEvent>>,
}

/// The ring buffer.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    free_available: Condvar,
    ready_available: Condvar,
}

impl RingBuffer {
    /// Creates a ring of `capacity` slots, each holding an event with a
    /// datagram buffer of `event_buffer_size` bytes.
    #[must_use]
    pub fn new(capacity: usize, event_buffer_size: usize) -> RingBuffer {
        let slots = (0..capacity)
            .map(|_| Slot {
                event: Arc::new(RwLock::new(CassEvent::allocate(event_buffer_size))),
                seq: 0,
                refs: 0,
                is_latest: false,
                published: false,
            })
            .collect();
        RingBuffer {
            inner: Mutex::new(Inner {
                slots,
                free: (0..capacity).collect(),
                ready: VecDeque::new(),
                by_seq: HashMap::new(),
                next_seq: 1,
                latest: None,
                end_of_stream: false,
            }),
            free_available: Condvar::new(),
            ready_available: Condvar::new(),
        }
    }

    /// Blocks until a free slot is available and checks it out for filling.
    /// Returns `None` once the ring is shut down.
    pub fn next_to_fill(&self) -> Option<FillHandle> {
        let mut inner = self.inner.lock().expect("ring poisoned");
        loop {
            if inner.end_of_stream {
                return None;
            }
            if let Some(index) = inner.free.pop_front() {
                let event = Arc::clone(&inner.slots[index].event);
                return Some(FillHandle { index, event });
            }
            inner = self.free_available.wait(inner).expect("ring poisoned");
        }
    }

    /// Publishes a filled slot (`accepted`) or releases it untouched.
    ///
    /// Returns the sequence number of the published event, or `None` when
    /// the slot was rejected.
    pub fn done_filling(&self, handle: FillHandle, accepted: bool) -> Option<Sequence> {
        let mut inner = self.inner.lock().expect("ring poisoned");
        let index = handle.index;
        drop(handle);
        if !accepted {
            inner.free.push_back(index);
            drop(inner);
            self.free_available.notify_one();
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        {
            let slot = &mut inner.slots[index];
            slot.seq = seq;
            slot.refs = 1; // the worker that will claim it
            slot.published = true;
            slot.is_latest = true;
        }
        inner.by_seq.insert(seq, index);

        // move the latest view over and reclaim the slot it left
        if let Some(previous) = inner.latest.replace(index) {
            if previous != index {
                inner.slots[previous].is_latest = false;
                inner.maybe_reclaim(previous);
                if !inner.free.is_empty() {
                    self.free_available.notify_one();
                }
            }
        }
        inner.ready.push_back(index);
        drop(inner);
        self.ready_available.notify_one();
        Some(seq)
    }

    /// Blocks until a published event is available and claims it. Returns
    /// `None` once the ring is shut down and drained.
    pub fn next_to_process(&self) -> Option<ProcessHandle> {
        let mut inner = self.inner.lock().expect("ring poisoned");
        loop {
            if let Some(index) = inner.ready.pop_front() {
                let slot = &inner.slots[index];
                return Some(ProcessHandle {
                    index,
                    seq: slot.seq,
                    event: Arc::clone(&slot.event),
                });
            }
            if inner.end_of_stream {
                return None;
            }
            inner = self.ready_available.wait(inner).expect("ring poisoned");
        }
    }

    /// Returns a claimed event; the slot is reclaimed once every reference
    /// is gone.
    pub fn done_processing(&self, handle: ProcessHandle) {
        let mut inner = self.inner.lock().expect("ring poisoned");
        let index = handle.index;
        drop(handle);
        let slot = &mut inner.slots[index];
        slot.refs = slot.refs.saturating_sub(1);
        inner.maybe_reclaim(index);
        if !inner.free.is_empty() {
            drop(inner);
            self.free_available.notify_one();
        }
    }

    /// Takes an additional reference on the event `seq`, keeping its slot
    /// alive. Returns false when the event is no longer resident.
    pub fn retain(&self, seq: Sequence) -> bool {
        let mut inner = self.inner.lock().expect("ring poisoned");
        match inner.by_seq.get(&seq).copied() {
            Some(index) => {
                inner.slots[index].refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drops a reference taken with [`RingBuffer::retain`].
    pub fn release(&self, seq: Sequence) {
        let mut inner = self.inner.lock().expect("ring poisoned");
        if let Some(index) = inner.by_seq.get(&seq).copied() {
            let slot = &mut inner.slots[index];
            if slot.refs == 0 {
                warn!("release of event {seq} without a matching retain");
            }
            slot.refs = slot.refs.saturating_sub(1);
            inner.maybe_reclaim(index);
            if !inner.free.is_empty() {
                drop(inner);
                self.free_available.notify_one();
            }
        }
    }

    /// Handle on the event `seq`, if it is still resident. The caller takes
    /// the read side of the lock.
    ///
    /// Hold a reference from [`RingBuffer::retain`] while using this,
    /// otherwise the slot can be recycled under the lookup.
    pub fn event_handle(&self, seq: Sequence) -> Option<Arc<RwLock<CassEvent>>> {
        let inner = self.inner.lock().expect("ring poisoned");
        let index = *inner.by_seq.get(&seq)?;
        Some(Arc::clone(&inner.slots[index].event))
    }

    /// A snapshot view of the most recently accepted event.
    pub fn with_latest<R>(&self, f: impl FnOnce(&CassEvent) -> R) -> Option<R> {
        let event = {
            let inner = self.inner.lock().expect("ring poisoned");
            let index = inner.latest?;
            Arc::clone(&inner.slots[index].event)
        };
        let guard = event.read().expect("event lock poisoned");
        Some(f(&guard))
    }

    /// Sets the sticky end-of-stream flag and wakes every waiter. Producers
    /// stop handing out slots; consumers drain the remaining events.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("ring poisoned");
        inner.end_of_stream = true;
        drop(inner);
        self.free_available.notify_all();
        self.ready_available.notify_all();
    }

    /// True once shut down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().expect("ring poisoned").end_of_stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn fill_one(ring: &RingBuffer, id: u64) -> Sequence {
        let handle = ring.next_to_fill().unwrap();
        handle.event.write().unwrap().set_id(id);
        ring.done_filling(handle, true).unwrap()
    }

    #[test]
    fn fill_process_cycle() {
        let ring = RingBuffer::new(2, 64);
        let seq = fill_one(&ring, 17);
        let handle = ring.next_to_process().unwrap();
        assert_eq!(handle.seq, seq);
        assert_eq!(handle.event.read().unwrap().id(), 17);
        ring.done_processing(handle);
    }

    #[test]
    fn rejected_slots_are_recycled_immediately() {
        let ring = RingBuffer::new(1, 64);
        let handle = ring.next_to_fill().unwrap();
        assert!(ring.done_filling(handle, false).is_none());
        // the single slot is free again
        let handle = ring.next_to_fill().unwrap();
        ring.done_filling(handle, true);
    }

    #[test]
    fn retained_slots_survive_the_worker() {
        // capacity 2: the latest view pins one slot, the retain the other
        let ring = RingBuffer::new(2, 64);
        let seq = fill_one(&ring, 1);
        assert!(ring.retain(seq));

        let handle = ring.next_to_process().unwrap();
        ring.done_processing(handle);

        // still readable because of the retain
        let event = ring.event_handle(seq).unwrap();
        assert_eq!(event.read().unwrap().id(), 1);
        drop(event);
        ring.release(seq);

        let seq2 = fill_one(&ring, 2);
        let handle = ring.next_to_process().unwrap();
        assert_eq!(handle.seq, seq2);
        ring.done_processing(handle);
        // the first event has aged out by now (latest moved to seq2)
        assert!(ring.event_handle(seq).is_none());
    }

    #[test]
    fn latest_tracks_the_most_recent_accept() {
        let ring = RingBuffer::new(3, 64);
        fill_one(&ring, 5);
        fill_one(&ring, 6);
        assert_eq!(ring.with_latest(|evt| evt.id()), Some(6));
    }

    #[test]
    fn shutdown_drains_consumers() {
        let ring = Arc::new(RingBuffer::new(2, 64));
        let seen = Arc::new(AtomicU64::new(0));

        let consumer = {
            let ring = Arc::clone(&ring);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                while let Some(handle) = ring.next_to_process() {
                    seen.fetch_add(1, Ordering::SeqCst);
                    ring.done_processing(handle);
                }
            })
        };

        fill_one(&ring, 1);
        fill_one(&ring, 2);
        ring.shutdown();
        consumer.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(ring.next_to_fill().is_none());
    }
}
