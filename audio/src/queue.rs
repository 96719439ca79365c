//! Lock-free single-producer single-consumer queue carrying subwoofer
//! samples from the audio callback (core 0) to the PDM modulator (core 1).
//!
//! 256 entries with 8-bit head/tail indices, so wraparound is implicit in
//! the index arithmetic. The producer publishes the payload with a release
//! store of `head`; the consumer pairs it with an acquire load. The RP2040's
//! event signal (`SEV`) alone is not a memory barrier, which is why the
//! ordering lives here and not in the wakeup path.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

/// One subwoofer sample in Q28, plus a reset request.
///
/// The producer currently never asserts `reset`; the consumer still honors
/// it by zeroing the modulator integrators and emitting silence for the
/// sample.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct PdmMessage {
    pub sample: i32,
    pub reset: bool,
}

const RING_SIZE: usize = 256;

pub struct PdmQueue {
    ring: UnsafeCell<[PdmMessage; RING_SIZE]>,
    head: AtomicU8,
    tail: AtomicU8,
}

// One writer on one core, one reader on the other; the head/tail protocol
// below is the synchronization.
unsafe impl Sync for PdmQueue {}

impl PdmQueue {
    pub const fn new() -> Self {
        PdmQueue {
            ring: UnsafeCell::new(
                [PdmMessage {
                    sample: 0,
                    reset: false,
                }; RING_SIZE],
            ),
            head: AtomicU8::new(0),
            tail: AtomicU8::new(0),
        }
    }

    /// Producer side. Returns `false` (dropping the message) when full.
    #[cfg_attr(target_os = "none", link_section = ".data.ram_func")]
    #[inline(never)]
    pub fn push(&self, message: PdmMessage) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next_head = head.wrapping_add(1);
        if next_head == self.tail.load(Ordering::Acquire) {
            return false;
        }

        // Only the producer writes this slot, and the consumer will not
        // read it until the head store below is visible.
        unsafe {
            (*self.ring.get())[head as usize] = message;
        }
        self.head.store(next_head, Ordering::Release);
        true
    }

    /// Consumer side.
    #[cfg_attr(target_os = "none", link_section = ".data.ram_func")]
    #[inline(never)]
    pub fn pop(&self) -> Option<PdmMessage> {
        let tail = self.tail.load(Ordering::Relaxed);
        if self.head.load(Ordering::Acquire) == tail {
            return None;
        }

        let message = unsafe { (*self.ring.get())[tail as usize] };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(message)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire)) as usize
    }
}

impl Default for PdmQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
    use std::sync::Arc;

    #[test]
    fn empty_queue_pops_nothing() {
        let queue = PdmQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = PdmQueue::new();
        for i in 0..100 {
            assert!(queue.push(PdmMessage {
                sample: i,
                reset: false,
            }));
        }
        for i in 0..100 {
            assert_eq!(queue.pop().unwrap().sample, i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_reports_full_at_capacity() {
        let queue = PdmQueue::new();
        let mut accepted = 0;
        for i in 0..300 {
            if queue.push(PdmMessage {
                sample: i,
                reset: false,
            }) {
                accepted += 1;
            }
        }
        // One slot is sacrificed to distinguish full from empty.
        assert_eq!(accepted, 255);
        assert_eq!(queue.len(), 255);

        // Draining one slot frees exactly one push.
        queue.pop().unwrap();
        assert!(queue.push(PdmMessage::default()));
        assert!(!queue.push(PdmMessage::default()));
    }

    #[test]
    fn concurrent_producer_consumer_never_duplicates_or_reorders() {
        let queue = Arc::new(PdmQueue::new());
        let done = Arc::new(AtomicBool::new(false));
        const COUNT: i32 = 200_000;

        let producer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut next = 0;
                while next < COUNT {
                    if queue.push(PdmMessage {
                        sample: next,
                        reset: false,
                    }) {
                        next += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
                done.store(true, StdOrdering::Release);
            })
        };

        let mut expected = 0;
        loop {
            match queue.pop() {
                Some(message) => {
                    assert_eq!(message.sample, expected, "reordered or duplicated");
                    expected += 1;
                }
                None => {
                    if done.load(StdOrdering::Acquire) && queue.is_empty() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }

        producer.join().unwrap();
        assert_eq!(expected, COUNT);
    }
}
