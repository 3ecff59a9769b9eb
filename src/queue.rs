// SPDX-License-Identifier: Apache-2.0 OR MIT
// Bounded lock-free MPSC queue of frames
//
// Vyukov-style bounded ring: each slot carries a sequence number that
// encodes whether it is producible or consumable for the current lap.
// Producers claim a position with a CAS loop on `tail`, write the
// frame, then publish by bumping the slot sequence. The single consumer
// reads sequentially from `head` and recycles each slot one full lap
// ahead. The fast path takes no locks; only park/unpark touches the
// condvars.

use crate::encode::Frame;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cache-aligned wrapper to prevent false sharing
#[repr(align(64))]
struct CacheAligned<T>(T);

/// What a producer does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Back off, then park until the consumer frees a slot.
    Block,
    /// Drop the record being enqueued.
    #[default]
    DropNewest,
    /// Ask the consumer to discard its oldest frame, retry briefly,
    /// then fall back to dropping the new record.
    DropOldest,
}

pub(crate) enum Dequeue {
    Frame(Frame),
    Timeout,
    Shutdown,
}

struct Slot {
    seq: AtomicUsize,
    frame: UnsafeCell<Option<Frame>>,
}

pub(crate) struct FrameQueue {
    slots: Box<[Slot]>,
    mask: usize,
    tail: CacheAligned<AtomicUsize>,
    head: CacheAligned<AtomicUsize>,
    dropped: AtomicU64,
    evict_requests: AtomicU64,
    shutdown: AtomicBool,
    sync: Mutex<()>,
    not_empty: Condvar,
    not_full: Condvar,
    consumer_parked: AtomicBool,
    producers_waiting: AtomicUsize,
}

// SAFETY: slot cells are exclusively owned between the CAS claim and
// the sequence publish (producer side) and between the sequence check
// and the recycle store (single consumer side). The sequence numbers
// form the happens-before edges via Release/Acquire.
unsafe impl Send for FrameQueue {}
unsafe impl Sync for FrameQueue {}

impl FrameQueue {
    /// # Panics
    /// Panics if capacity is not a power of 2
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "Capacity must be power of 2");
        let slots: Vec<Slot> = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                frame: UnsafeCell::new(None),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            tail: CacheAligned(AtomicUsize::new(0)),
            head: CacheAligned(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
            evict_requests: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            sync: Mutex::new(()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            consumer_parked: AtomicBool::new(false),
            producers_waiting: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Enqueue without blocking. Returns the frame back when the
    /// claimed position would lag the consumer by a full capacity.
    pub(crate) fn try_enqueue(&self, frame: Frame) -> Result<(), Frame> {
        let mut tail = self.tail.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[tail & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = (seq as isize).wrapping_sub(tail as isize);
            if dif == 0 {
                match self.tail.0.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // This position is exclusively ours until the
                        // sequence bump below.
                        unsafe {
                            *slot.frame.get() = Some(frame);
                        }
                        slot.seq.store(tail.wrapping_add(1), Ordering::Release);
                        self.wake_consumer();
                        return Ok(());
                    }
                    Err(current) => {
                        tail = current;
                        std::hint::spin_loop();
                    }
                }
            } else if dif < 0 {
                return Err(frame);
            } else {
                tail = self.tail.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue under the block-producer policy: bounded exponential
    /// backoff, then park until the consumer signals not-full. Returns
    /// the frame back only if shutdown latches while waiting.
    pub(crate) fn enqueue_blocking(&self, mut frame: Frame) -> Result<(), Frame> {
        let mut spins = 1u32;
        loop {
            match self.try_enqueue(frame) {
                Ok(()) => return Ok(()),
                Err(back) => frame = back,
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(frame);
            }
            if spins <= 1024 {
                for _ in 0..spins {
                    std::hint::spin_loop();
                }
                spins *= 2;
                continue;
            }
            let guard = self.sync.lock().unwrap_or_else(|e| e.into_inner());
            self.producers_waiting.fetch_add(1, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            // Recheck with the flag raised so a concurrent dequeue
            // cannot slip between the check and the wait.
            if self.len() < self.capacity() || self.shutdown.load(Ordering::Acquire) {
                self.producers_waiting.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
            let (_guard, _timeout) = self
                .not_full
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap_or_else(|e| e.into_inner());
            self.producers_waiting.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Dequeue without signalling. Callers must invoke wake_producers
    /// afterwards, outside the sync mutex (the mutex is not reentrant).
    fn try_dequeue_inner(&self) -> Option<Frame> {
        let head = self.head.0.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq != head.wrapping_add(1) {
            return None;
        }
        let frame = unsafe { (*slot.frame.get()).take() };
        debug_assert!(frame.is_some(), "published slot held no frame");
        // Make the slot producible again, one lap ahead.
        slot.seq
            .store(head.wrapping_add(self.mask + 1), Ordering::Release);
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        frame
    }

    fn try_dequeue(&self) -> Option<Frame> {
        let frame = self.try_dequeue_inner();
        if frame.is_some() {
            self.wake_producers();
        }
        frame
    }

    /// Single-consumer dequeue with a bounded spin, then a parked wait.
    /// Returns Shutdown only once the queue is empty after the shutdown
    /// signal has latched.
    pub(crate) fn dequeue_blocking(&self, timeout: Duration) -> Dequeue {
        if let Some(frame) = self.try_dequeue() {
            return Dequeue::Frame(frame);
        }
        for _ in 0..64 {
            std::hint::spin_loop();
            if let Some(frame) = self.try_dequeue() {
                return Dequeue::Frame(frame);
            }
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.sync.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            self.consumer_parked.store(true, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if let Some(frame) = self.try_dequeue_inner() {
                self.consumer_parked.store(false, Ordering::Relaxed);
                drop(guard);
                self.wake_producers();
                return Dequeue::Frame(frame);
            }
            if self.shutdown.load(Ordering::Acquire) {
                self.consumer_parked.store(false, Ordering::Relaxed);
                return Dequeue::Shutdown;
            }
            let now = Instant::now();
            if now >= deadline {
                self.consumer_parked.store(false, Ordering::Relaxed);
                return Dequeue::Timeout;
            }
            let (reacquired, _timeout) = self
                .not_empty
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = reacquired;
        }
    }

    fn wake_consumer(&self) {
        fence(Ordering::SeqCst);
        if self.consumer_parked.load(Ordering::Relaxed) {
            let _guard = self.sync.lock().unwrap_or_else(|e| e.into_inner());
            self.not_empty.notify_one();
        }
    }

    fn wake_producers(&self) {
        fence(Ordering::SeqCst);
        if self.producers_waiting.load(Ordering::Relaxed) > 0 {
            let _guard = self.sync.lock().unwrap_or_else(|e| e.into_inner());
            self.not_full.notify_all();
        }
    }

    /// Latch shutdown and wake everyone.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.sync.lock().unwrap_or_else(|e| e.into_inner());
        self.not_empty.notify_one();
        self.not_full.notify_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count records dropped by overflow policy. Incremented exactly
    /// once per dropped record.
    pub(crate) fn record_drop(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Producer-side request (drop-oldest policy) for the consumer to
    /// discard its oldest frame.
    pub(crate) fn request_evict(&self) {
        self.evict_requests.fetch_add(1, Ordering::Relaxed);
        self.wake_consumer();
    }

    /// Consumer side: take one pending eviction request, if any.
    pub(crate) fn take_evict_request(&self) -> bool {
        let mut current = self.evict_requests.load(Ordering::Relaxed);
        while current > 0 {
            match self.evict_requests.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    /// Consumer side: discard the oldest frame on behalf of a producer.
    pub(crate) fn evict_oldest(&self) -> bool {
        match self.try_dequeue() {
            Some(frame) => {
                drop(frame);
                self.record_drop(1);
                true
            }
            None => false,
        }
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        // Release any frames still queued so their storage is pooled.
        while self.try_dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::encode::encode_diagnostic;
    use crate::severity::Severity;
    use std::sync::Arc;
    use std::thread;

    fn frame(text: &str) -> Frame {
        encode_diagnostic(Severity::INFO, text)
    }

    fn message(frame: &Frame) -> String {
        let view = frame.view().unwrap();
        match view.components().next() {
            Some(Component::Str(s)) => s.to_string(),
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(8);
        queue.try_enqueue(frame("a")).ok().unwrap();
        queue.try_enqueue(frame("b")).ok().unwrap();
        assert_eq!(queue.len(), 2);

        match queue.dequeue_blocking(Duration::from_millis(10)) {
            Dequeue::Frame(f) => assert_eq!(message(&f), "a"),
            _ => panic!("expected frame"),
        }
        match queue.dequeue_blocking(Duration::from_millis(10)) {
            Dequeue::Frame(f) => assert_eq!(message(&f), "b"),
            _ => panic!("expected frame"),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_returns_frame() {
        let queue = FrameQueue::new(4);
        for i in 0..4 {
            queue.try_enqueue(frame(&format!("m{}", i))).ok().unwrap();
        }
        assert!(queue.try_enqueue(frame("overflow")).is_err());

        // Freeing one slot admits exactly one more.
        match queue.dequeue_blocking(Duration::from_millis(10)) {
            Dequeue::Frame(f) => assert_eq!(message(&f), "m0"),
            _ => panic!("expected frame"),
        }
        assert!(queue.try_enqueue(frame("again")).is_ok());
    }

    #[test]
    fn test_wraparound() {
        let queue = FrameQueue::new(4);
        for lap in 0..3 {
            for i in 0..4 {
                queue
                    .try_enqueue(frame(&format!("l{}i{}", lap, i)))
                    .ok()
                    .unwrap();
            }
            for i in 0..4 {
                match queue.dequeue_blocking(Duration::from_millis(10)) {
                    Dequeue::Frame(f) => assert_eq!(message(&f), format!("l{}i{}", lap, i)),
                    _ => panic!("expected frame"),
                }
            }
        }
    }

    #[test]
    fn test_dequeue_timeout() {
        let queue = FrameQueue::new(4);
        let start = Instant::now();
        match queue.dequeue_blocking(Duration::from_millis(20)) {
            Dequeue::Timeout => {}
            _ => panic!("expected timeout"),
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_shutdown_after_drain() {
        let queue = FrameQueue::new(4);
        queue.try_enqueue(frame("last")).ok().unwrap();
        queue.shutdown();

        // The queued frame is still delivered before Shutdown.
        match queue.dequeue_blocking(Duration::from_millis(10)) {
            Dequeue::Frame(f) => assert_eq!(message(&f), "last"),
            _ => panic!("expected frame"),
        }
        match queue.dequeue_blocking(Duration::from_millis(10)) {
            Dequeue::Shutdown => {}
            _ => panic!("expected shutdown"),
        }
    }

    #[test]
    fn test_concurrent_producers_nothing_lost() {
        let queue = Arc::new(FrameQueue::new(1024));
        let mut handles = vec![];
        for producer in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let f = frame(&format!("t{}m{}", producer, i));
                    queue.try_enqueue(f).ok().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut per_producer = [0usize; 4];
        let mut count = 0;
        while let Dequeue::Frame(f) = queue.dequeue_blocking(Duration::from_millis(10)) {
            let text = message(&f);
            let producer: usize = text[1..2].parse().unwrap();
            let index: usize = text[3..].parse().unwrap();
            // Per-producer order is preserved in the total order.
            assert_eq!(index, per_producer[producer]);
            per_producer[producer] += 1;
            count += 1;
            if count == 400 {
                break;
            }
        }
        assert_eq!(count, 400);
    }

    #[test]
    fn test_blocking_producer_unblocks_on_dequeue() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.try_enqueue(frame("a")).ok().unwrap();
        queue.try_enqueue(frame("b")).ok().unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue_blocking(frame("c")).is_ok())
        };

        thread::sleep(Duration::from_millis(20));
        let mut seen = vec![];
        for _ in 0..3 {
            match queue.dequeue_blocking(Duration::from_millis(200)) {
                Dequeue::Frame(f) => seen.push(message(&f)),
                _ => panic!("expected frame"),
            }
        }
        assert!(producer.join().unwrap());
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_evict_oldest() {
        let queue = FrameQueue::new(2);
        queue.try_enqueue(frame("old")).ok().unwrap();
        queue.try_enqueue(frame("mid")).ok().unwrap();
        queue.request_evict();
        assert!(queue.take_evict_request());
        assert!(queue.evict_oldest());
        assert_eq!(queue.dropped_total(), 1);
        assert!(queue.try_enqueue(frame("new")).is_ok());

        match queue.dequeue_blocking(Duration::from_millis(10)) {
            Dequeue::Frame(f) => assert_eq!(message(&f), "mid"),
            _ => panic!("expected frame"),
        }
    }
}
