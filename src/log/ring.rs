//! Event Ring (component G): a bounded, lock-free multi-producer /
//! single-consumer queue of [`Event`]s, with drop-on-full semantics.
//!
//! The teacher's sample ring (`sample/rb/mod.rs`) reads a kernel-owned
//! mmap region with a single atomic tail the consumer advances; this
//! ring owns its storage and needs to accept pushes from several threads
//! (the poll thread and callers of `adjust`), so it follows Dmitry
//! Vyukov's bounded MPMC array queue instead: per-slot sequence numbers
//! take the place of the teacher's single head/tail pair.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::Event;

struct Slot {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<Event>>,
}

/// Fixed-capacity event queue. Capacity is rounded up to a power of two.
pub struct EventRing {
    buffer: Box<[Slot]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
    dropped: AtomicU64,
}

// Safety: `Slot::value` is only ever touched by the thread that wins the
// CAS on `sequence`, which is exactly the invariant a Vyukov queue relies
// on to be `Sync` despite the interior `UnsafeCell`.
unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

impl EventRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let buffer: Box<[Slot]> = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes `event`. Returns `false` (and bumps the drop counter)
    /// rather than blocking if the ring is full.
    pub fn push(&self, event: Event) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { (*slot.value.get()).write(event) };
                    slot.sequence.store(pos + 1, Ordering::Release);
                    return true;
                }
            } else if diff < 0 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops the oldest pending event, if any. Intended to be called from
    /// a single consumer thread (the writer thread, component J).
    pub fn pop(&self) -> Option<Event> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;

            if diff == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let event = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.sequence.store(pos + self.mask + 1, Ordering::Release);
                    return Some(event);
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl Drop for EventRing {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
