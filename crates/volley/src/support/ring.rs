//! Bounded lock-free multi-producer multi-consumer ring.
//!
//! Each slot carries a sequence number. For the lap starting at position
//! `pos`, a slot is free for writing when its sequence equals `pos`, and
//! holds a value ready for reading when it equals `pos + 1`. Reading a slot
//! hands it to the next lap by storing `pos + capacity`.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::StrategyError;

/// Keeps head and tail on separate cache lines.
#[repr(align(64))]
struct CachePadded<T>(T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub(crate) struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: a slot's value is only touched by the thread that won the
// head/tail compare-and-set for its position, and the slot sequence
// (release on publish, acquire on claim) orders those accesses.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Capacity must be a power of two, at least 2.
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self, StrategyError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(StrategyError::InvalidConfig(format!(
                "ring capacity must be a power of two >= 2, got {capacity}"
            )));
        }
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Ok(Self {
            slots,
            mask: capacity - 1,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate number of queued values.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity())
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the next position to read already holds a value.
    pub(crate) fn has_next(&self) -> bool {
        let pos = self.head.load(Ordering::Acquire);
        let slot = &self.slots[pos & self.mask];
        slot.sequence.load(Ordering::Acquire) == pos.wrapping_add(1)
    }

    /// Whether the next position to write is free.
    pub(crate) fn has_space(&self) -> bool {
        let pos = self.tail.load(Ordering::Acquire);
        let slot = &self.slots[pos & self.mask];
        slot.sequence.load(Ordering::Acquire) == pos
    }

    /// Enqueue without waiting. Hands the value back when the ring is full.
    pub(crate) fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the tail CAS for `pos` while the slot
                        // sequence equals `pos` grants exclusive write access.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue without waiting.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the slot was published for `pos` and winning
                        // the head CAS makes this the only reader.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let tail = *self.tail.0.get_mut();
        let mut pos = head;
        while pos != tail {
            let index = pos & self.mask;
            let slot = &mut self.slots[index];
            if *slot.sequence.get_mut() == pos.wrapping_add(1) {
                // SAFETY: the sequence says this slot was published and never read.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
            pos = pos.wrapping_add(1);
        }
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(RingBuffer::<u8>::with_capacity(0).is_err());
        assert!(RingBuffer::<u8>::with_capacity(1).is_err());
        assert!(RingBuffer::<u8>::with_capacity(6).is_err());
        assert!(RingBuffer::<u8>::with_capacity(8).is_ok());
    }

    #[test]
    fn test_fifo_and_full() {
        let ring = RingBuffer::with_capacity(4).unwrap();
        for i in 0..4 {
            ring.try_push(i).unwrap();
        }
        assert_eq!(ring.try_push(99), Err(99));
        assert!(!ring.has_space());
        assert_eq!(ring.len(), 4);
        assert!(ring.has_next());

        assert_eq!(ring.try_pop(), Some(0));
        ring.try_push(4).unwrap();
        let drained: Vec<_> = std::iter::from_fn(|| ring.try_pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(ring.is_empty());
        assert!(!ring.has_next());
    }

    #[test]
    fn test_drop_releases_unread_values() {
        let token = Arc::new(());
        {
            let ring = RingBuffer::with_capacity(4).unwrap();
            ring.try_push(token.clone()).unwrap();
            ring.try_push(token.clone()).unwrap();
            drop(ring.try_pop());
            assert_eq!(Arc::strong_count(&token), 2);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;

        let ring = Arc::new(RingBuffer::with_capacity(64).unwrap());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut value = p * PER_PRODUCER + i;
                        while let Err(v) = ring.try_push(value) {
                            value = v;
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ring = ring.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while seen.len() < PRODUCERS * PER_PRODUCER / 2 {
                        match ring.try_pop() {
                            Some(v) => seen.push(v),
                            None => std::hint::spin_loop(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "value {v} delivered twice");
            }
        }
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
    }
}
