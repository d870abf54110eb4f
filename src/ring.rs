// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Instant;

/// Maximum number of distinct producer threads whose enqueue rate is tracked.
///
/// Excess producers still enqueue correctly, they are just excluded from
/// rate accounting.
pub const MAX_ENQ_THREAD: usize = 8;

/// Window of the enqueue/dequeue rate moving average.
const RATE_AVG_WINDOW: f64 = 16.0;

fn new_rate(old_rate: f64, cur_rate: f64) -> f64 {
    ((RATE_AVG_WINDOW - 1.0) / RATE_AVG_WINDOW) * old_rate + cur_rate / RATE_AVG_WINDOW
}

#[derive(Clone, Copy, Default)]
struct EnqSlot {
    thread: Option<ThreadId>,
    last_enq: Option<Instant>,
}

struct Inner<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    enq_rate: f64,
    deq_rate: f64,
    last_deq: Option<Instant>,
    producers: [EnqSlot; MAX_ENQ_THREAD],
}

impl<T> Inner<T> {
    fn count(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            (self.head + self.slots.len()) - self.tail
        }
    }

    /// Finds the rate slot index of the calling producer, claiming a free one
    /// on first use. Returns `None` once all slots are taken by other threads.
    fn producer_idx(&mut self) -> Option<usize> {
        let me = std::thread::current().id();

        let idx = self
            .producers
            .iter()
            .position(|slot| slot.thread == Some(me) || slot.thread.is_none())?;

        if let Some(slot) = self.producers.get_mut(idx) {
            slot.thread = Some(me);
        }

        Some(idx)
    }

    fn update_enq_rate(&mut self) {
        let now = Instant::now();

        let Some(idx) = self.producer_idx() else {
            return;
        };

        if let Some(last) = self.producers.get(idx).and_then(|slot| slot.last_enq) {
            let gap = now.duration_since(last).as_secs_f64();
            if gap > 0.0 {
                self.enq_rate = new_rate(self.enq_rate, 1.0 / gap);
            }
        }

        if let Some(slot) = self.producers.get_mut(idx) {
            slot.last_enq = Some(now);
        }
    }

    fn update_deq_rate(&mut self) {
        let now = Instant::now();

        if let Some(last) = self.last_deq {
            let gap = now.duration_since(last).as_secs_f64();
            if gap > 0.0 {
                self.deq_rate = new_rate(self.deq_rate, 1.0 / gap);
            }
        }

        self.last_deq = Some(now);
    }

    /// A full ring means the producer is stalled; forget its timestamp so the
    /// next successful enqueue does not fold the stall into the average.
    fn note_enq_stall(&mut self) {
        if let Some(idx) = self.producer_idx() {
            if let Some(slot) = self.producers.get_mut(idx) {
                slot.last_enq = None;
            }
        }
    }

    fn note_deq_stall(&mut self) {
        self.last_deq = None;
    }
}

/// A bounded, mutex-protected circular FIFO with enqueue/dequeue rate tracking.
///
/// One slot is always left unused to distinguish full from empty, so a ring
/// of capacity `N` holds at most `N - 1` items. Neither [`Ring::enq`] nor
/// [`Ring::deq`] blocks; callers retry after a short sleep or condition wait.
///
/// The enqueue rate is attributed per producer thread (up to
/// [`MAX_ENQ_THREAD`] of them); the dequeue side assumes a single consumer.
pub struct Ring<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

impl<T> Ring<T> {
    /// Creates a ring with the given slot count.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2` (a one-slot ring could never hold an item).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots,
                head: 0,
                tail: 0,
                enq_rate: 0.0,
                deq_rate: 0.0,
                last_deq: None,
                producers: [EnqSlot::default(); MAX_ENQ_THREAD],
            }),
        }
    }

    /// Enqueues an item.
    ///
    /// On a full ring the item is handed back to the caller.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    pub fn enq(&self, item: T) -> std::result::Result<(), T> {
        let mut inner = self.lock();

        let new_head = (inner.head + 1) % self.capacity;

        if new_head == inner.tail {
            inner.note_enq_stall();
            return Err(item);
        }

        let head = inner.head;
        if let Some(slot) = inner.slots.get_mut(head) {
            *slot = Some(item);
        }
        inner.head = new_head;
        inner.update_enq_rate();

        Ok(())
    }

    /// Dequeues the oldest item, or `None` if the ring is empty.
    pub fn deq(&self) -> Option<T> {
        let mut inner = self.lock();

        if inner.head == inner.tail {
            inner.note_deq_stall();
            return None;
        }

        let tail = inner.tail;
        let item = inner.slots.get_mut(tail).and_then(Option::take);
        inner.tail = (tail + 1) % self.capacity;
        inner.update_deq_rate();

        item
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().count()
    }

    /// Whether the ring holds no items.
    ///
    /// Observing empty resets the dequeue timestamp (output stall).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let mut inner = self.lock();

        if inner.head == inner.tail {
            inner.note_deq_stall();
            true
        } else {
            false
        }
    }

    /// Whether the ring cannot accept another item.
    ///
    /// Observing full resets the calling producer's timestamp (input stall).
    #[must_use]
    pub fn is_full(&self) -> bool {
        let mut inner = self.lock();

        if (inner.head + 1) % self.capacity == inner.tail {
            inner.note_enq_stall();
            true
        } else {
            false
        }
    }

    /// Smoothed enqueue rate in items per second.
    #[must_use]
    pub fn enq_rate(&self) -> f64 {
        self.lock().enq_rate
    }

    /// Smoothed dequeue rate in items per second.
    #[must_use]
    pub fn deq_rate(&self) -> f64 {
        self.lock().deq_rate
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("lock is poisoned")
    }
}

impl<T> std::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ring(cap={}, len={})", self.capacity, self.count())
    }
}

#[cfg(test)]
mod tests {
    use super::Ring;
    use test_log::test;

    #[test]
    fn ring_fifo_order() {
        let ring = Ring::new(8);

        for x in 0..5 {
            ring.enq(x).expect("should enqueue");
        }
        for x in 0..5 {
            assert_eq!(Some(x), ring.deq());
        }
        assert_eq!(None, ring.deq());
    }

    #[test]
    fn ring_full_hands_item_back() {
        let ring = Ring::new(4);

        ring.enq(1).expect("should enqueue");
        ring.enq(2).expect("should enqueue");
        ring.enq(3).expect("should enqueue");

        assert!(ring.is_full());
        assert_eq!(Err(4), ring.enq(4));
        assert_eq!(3, ring.count());
    }

    #[test]
    fn ring_count_bounds() {
        let ring = Ring::new(4);
        assert!(ring.is_empty());
        assert_eq!(0, ring.count());

        // interleave and verify count always stays in [0, capacity - 1]
        for round in 0..20 {
            if ring.enq(round).is_ok() {
                assert!(ring.count() <= 3);
            }
            if round % 3 == 0 {
                ring.deq();
            }
            let count = ring.count();
            assert_eq!(count == 0, ring.is_empty());
            assert_eq!(count == 3, ring.is_full());
        }
    }

    #[test]
    fn ring_wraparound() {
        let ring = Ring::new(3);

        for x in 0..100 {
            ring.enq(x).expect("should enqueue");
            assert_eq!(Some(x), ring.deq());
        }
    }

    #[test]
    fn ring_enq_rate_moves() {
        let ring = Ring::new(16);

        assert_eq!(0.0, ring.enq_rate());

        // space the operations out so the instantaneous gaps are non-zero
        // even on coarse clocks
        for x in 0..10 {
            ring.enq(x).expect("should enqueue");
            std::thread::sleep(std::time::Duration::from_micros(200));
        }

        assert!(ring.enq_rate() > 0.0);
        assert_eq!(0.0, ring.deq_rate());

        for _ in 0..10 {
            ring.deq();
            std::thread::sleep(std::time::Duration::from_micros(200));
        }

        assert!(ring.deq_rate() > 0.0);
    }
}
