//! Lock-free fixed-capacity ring buffer for handing values between threads.
//!
//! Producers reserve a logical position by compare-and-swap on the write
//! cursor, store their value, then publish it through the slot stamp.
//! Consumers do the same on the read cursor. Nothing here takes a lock and
//! nothing allocates after construction.
//!
//! Slot stamps, for logical position `p` and capacity `N`:
//! - `2p`       slot is free for the producer that reserves `p`
//! - `2p + 1`   value for `p` is stored and readable
//! - `2(p + N)` value consumed, slot free for the next lap
//!
//! Doubling the position keeps "written" and "free for next lap" distinct
//! even when `N == 1`.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::{Backoff, CachePadded};
use tracing::{debug, trace};

use crate::error::Error;

/// Slot in the ring - one value plus its publication stamp
#[repr(C, align(64))] // one slot per cache line, producers don't false-share
struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new(stamp: usize) -> Self {
        Self {
            stamp: AtomicUsize::new(stamp),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

#[inline(always)]
const fn free_stamp(pos: usize) -> usize {
    pos.wrapping_mul(2)
}

#[inline(always)]
const fn ready_stamp(pos: usize) -> usize {
    pos.wrapping_mul(2).wrapping_add(1)
}

/// Decrements the in-flight counter when a publish attempt ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lock-free bounded ring buffer.
///
/// Any number of threads may publish and consume concurrently. Values come
/// out in reservation order. A full ring never overwrites: `publish` waits
/// for a consumer to free the slot and `try_publish` hands the value back.
///
/// The buffer owns a value only between publish and consume. It never looks
/// inside it, so handles such as `Arc<U>` or `Box<U>` pass through untouched.
pub struct RingBuffer<T> {
    // Producer side
    write: CachePadded<AtomicUsize>,
    // Consumer side
    read: CachePadded<AtomicUsize>,
    // Producers between "reservation started" and "store published"
    in_flight: CachePadded<AtomicUsize>,
    slots: Box<[Slot<T>]>,
    capacity: usize,
    mask: usize,
}

// SAFETY: RingBuffer can be shared between threads because:
// - write/read cursors are only advanced by CAS, so every position has
//   exactly one producer and one consumer
// - a slot value is touched only by the thread that won its position, and
//   the stamp (Release store, Acquire load) orders the store before the read
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates an empty ring with `capacity` slots.
    ///
    /// `capacity` must be a power of two. Anything else, zero included, is
    /// rejected before any allocation happens.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(capacity));
        }

        let slots: Box<[Slot<T>]> = (0..capacity).map(|pos| Slot::new(free_stamp(pos))).collect();

        debug!(capacity, "ring buffer allocated");

        Ok(Self {
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            slots,
            capacity,
            mask: capacity - 1,
        })
    }

    /// Publishes `value`, waiting while the ring is full.
    ///
    /// Lossless: an unconsumed slot is never overwritten. The wait spins
    /// briefly, then yields to the scheduler until a consumer catches up.
    pub fn publish(&self, value: T) {
        let _in_flight = InFlight::enter(&self.in_flight);
        let backoff = Backoff::new();
        let mut value = value;
        let mut waiting = false;

        loop {
            match self.push_slot(value) {
                Ok(()) => return,
                Err(rejected) => {
                    if !waiting {
                        trace!(capacity = self.capacity, "ring full, producer waiting");
                        waiting = true;
                    }
                    value = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    /// Publishes `value` unless the ring is full, in which case it is
    /// returned untouched.
    #[inline]
    pub fn try_publish(&self, value: T) -> Result<(), T> {
        let _in_flight = InFlight::enter(&self.in_flight);
        self.push_slot(value)
    }

    /// Like [`publish`](Self::publish) but gives the value back if the ring
    /// stays full for `timeout`.
    pub fn publish_timeout(&self, value: T, timeout: Duration) -> Result<(), T> {
        let _in_flight = InFlight::enter(&self.in_flight);
        let deadline = Instant::now().checked_add(timeout);
        let backoff = Backoff::new();
        let mut value = value;

        loop {
            match self.push_slot(value) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        debug!(?timeout, "publish timed out on a full ring");
                        return Err(rejected);
                    }
                    value = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    /// Takes the oldest value, waiting until one is published.
    ///
    /// The wait yields to the scheduler rather than burning a core, but it
    /// is unbounded. Use [`consume_timeout`](Self::consume_timeout) when the
    /// producers may go away.
    pub fn consume(&self) -> T {
        let backoff = Backoff::new();
        loop {
            if let Some(value) = self.pop_slot() {
                return value;
            }
            backoff.snooze();
        }
    }

    /// Takes the oldest value, or `None` if nothing has been published.
    ///
    /// If a producer has reserved the next position but not finished its
    /// store, this waits for the store to land instead of reporting empty.
    #[inline]
    pub fn try_consume(&self) -> Option<T> {
        self.pop_slot()
    }

    /// Takes the oldest value, failing with [`Error::Timeout`] if nothing
    /// arrives within `timeout`.
    pub fn consume_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now().checked_add(timeout);
        let backoff = Backoff::new();

        loop {
            if let Some(value) = self.pop_slot() {
                return Ok(value);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(?timeout, "consume timed out on an empty ring");
                return Err(Error::Timeout(timeout));
            }
            backoff.snooze();
        }
    }

    /// Number of published-but-unconsumed entries.
    ///
    /// Taken from a snapshot in which the read cursor did not move, so it
    /// never underflows and never exceeds the capacity. Under concurrent use
    /// it is stale as soon as it returns.
    pub fn size(&self) -> usize {
        loop {
            let read = self.read.load(Ordering::SeqCst);
            let write = self.write.load(Ordering::SeqCst);

            if self.read.load(Ordering::SeqCst) == read {
                return write.wrapping_sub(read);
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True when the ring is at (or, transiently, beyond) capacity
    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Producers currently inside a publish call
    pub fn in_flight_writes(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Total reservations made so far (wrapping)
    pub fn write_cursor(&self) -> usize {
        self.write.load(Ordering::Acquire)
    }

    /// Total consumptions made so far (wrapping)
    pub fn read_cursor(&self) -> usize {
        self.read.load(Ordering::Acquire)
    }

    /// One publish attempt. Spins through CAS contention, gives the value
    /// back only if the ring is full.
    fn push_slot(&self, value: T) -> Result<(), T> {
        let backoff = Backoff::new();
        let mut pos = self.write.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[pos & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let lag = stamp.wrapping_sub(free_stamp(pos)) as isize;

            if lag == 0 {
                match self.write.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this position ours and the
                        // stamp says the previous lap was consumed
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.stamp.store(ready_stamp(pos), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        pos = current;
                        backoff.spin();
                    }
                }
            } else if lag < 0 {
                // Slot still holds the previous lap
                atomic::fence(Ordering::SeqCst);
                let read = self.read.load(Ordering::Relaxed);

                if read.wrapping_add(self.capacity) == pos {
                    return Err(value);
                }
                backoff.spin();
                pos = self.write.load(Ordering::Relaxed);
            } else {
                // Another producer already took this position
                backoff.snooze();
                pos = self.write.load(Ordering::Relaxed);
            }
        }
    }

    /// One consume attempt. Waits out an in-flight store, returns `None`
    /// only if nothing has been reserved past the read cursor.
    fn pop_slot(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut pos = self.read.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[pos & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let lag = stamp.wrapping_sub(ready_stamp(pos)) as isize;

            if lag == 0 {
                match self.read.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the stamp proves the producer finished its
                        // store and the CAS made this position ours
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.stamp.store(
                            free_stamp(pos.wrapping_add(self.capacity)),
                            Ordering::Release,
                        );
                        return Some(value);
                    }
                    Err(current) => {
                        pos = current;
                        backoff.spin();
                    }
                }
            } else if lag < 0 {
                atomic::fence(Ordering::SeqCst);
                let write = self.write.load(Ordering::Relaxed);

                if write == pos {
                    return None;
                }
                // Reserved by a producer whose store hasn't landed yet
                backoff.snooze();
                pos = self.read.load(Ordering::Relaxed);
            } else {
                // Another consumer already took this position
                backoff.spin();
                pos = self.read.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        if !std::mem::needs_drop::<T>() {
            return;
        }

        let mut pos = *self.read.get_mut();
        let write = *self.write.get_mut();

        // &mut self: no publish is mid-store, every position in
        // [read, write) holds an initialised value
        while pos != write {
            let slot = &mut self.slots[pos & self.mask];
            unsafe {
                slot.value.get_mut().assume_init_drop();
            }
            pos = pos.wrapping_add(1);
        }
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .field("in_flight", &self.in_flight_writes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_power_of_two_capacities() {
        for shift in 0..=16 {
            let capacity = 1usize << shift;
            let rb: RingBuffer<u64> = RingBuffer::new(capacity).unwrap();

            assert_eq!(rb.capacity(), capacity);
            assert!(rb.is_empty());
            assert!(!rb.is_full());
            assert_eq!(rb.size(), 0);
        }
    }

    #[test]
    fn test_invalid_capacity() {
        for capacity in [0, 3, 5, 6, 7, 12, 100, 1000, usize::MAX] {
            let err = RingBuffer::<u64>::new(capacity).unwrap_err();
            assert_eq!(err, Error::InvalidCapacity(capacity));
        }
    }

    #[test]
    fn test_invalid_capacity_message() {
        let err = RingBuffer::<u64>::new(100).unwrap_err();
        assert_eq!(err.to_string(), "100 is not a power of two");
    }

    #[test]
    fn test_basic_publish_consume() {
        let rb: RingBuffer<&str> = RingBuffer::new(8).unwrap();

        rb.publish("a");
        rb.publish("b");
        assert_eq!(rb.size(), 2);

        assert_eq!(rb.consume(), "a");
        assert_eq!(rb.consume(), "b");
        assert!(rb.is_empty());
    }

    #[test]
    fn test_full_buffer() {
        let rb: RingBuffer<u64> = RingBuffer::new(4).unwrap();

        for i in 0..4 {
            assert!(rb.try_publish(i).is_ok());
        }

        assert!(rb.is_full());
        assert_eq!(rb.size(), 4);
        assert_eq!(rb.try_publish(99), Err(99)); // full, handed back

        assert_eq!(rb.try_consume(), Some(0));
        assert!(!rb.is_full());
        assert!(rb.try_publish(4).is_ok());
        assert_eq!(rb.size(), 4);
    }

    #[test]
    fn test_capacity_one() {
        let rb: RingBuffer<u64> = RingBuffer::new(1).unwrap();

        for i in 0..10 {
            assert!(rb.try_publish(i).is_ok());
            assert!(rb.is_full());
            assert_eq!(rb.try_publish(i + 100), Err(i + 100));
            assert_eq!(rb.try_consume(), Some(i));
            assert!(rb.is_empty());
        }
    }

    #[test]
    fn test_wraparound() {
        let rb: RingBuffer<u64> = RingBuffer::new(4).unwrap();

        // Fill and drain multiple times to walk the cursors past the slots
        for round in 0..10 {
            for i in 0..4 {
                assert!(rb.try_publish(round * 4 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(rb.try_consume(), Some(round * 4 + i));
            }
        }

        assert_eq!(rb.write_cursor(), 40);
        assert_eq!(rb.read_cursor(), 40);
    }

    #[test]
    fn test_try_consume_empty() {
        let rb: RingBuffer<u64> = RingBuffer::new(8).unwrap();
        assert_eq!(rb.try_consume(), None);

        rb.publish(1);
        assert_eq!(rb.try_consume(), Some(1));
        assert_eq!(rb.try_consume(), None);
    }

    #[test]
    fn test_consume_timeout_empty() {
        let rb: RingBuffer<u64> = RingBuffer::new(8).unwrap();
        let timeout = Duration::from_millis(10);

        assert_eq!(rb.consume_timeout(timeout), Err(Error::Timeout(timeout)));

        rb.publish(7);
        assert_eq!(rb.consume_timeout(timeout), Ok(7));
    }

    #[test]
    fn test_publish_timeout_full() {
        let rb: RingBuffer<u64> = RingBuffer::new(2).unwrap();
        rb.publish(1);
        rb.publish(2);

        assert_eq!(rb.publish_timeout(3, Duration::from_millis(10)), Err(3));
        assert_eq!(rb.in_flight_writes(), 0);

        rb.consume();
        assert_eq!(rb.publish_timeout(3, Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn test_handles_are_moved_not_copied() {
        let rb: RingBuffer<Arc<String>> = RingBuffer::new(4).unwrap();
        let handle = Arc::new(String::from("payload"));

        rb.publish(Arc::clone(&handle));
        assert_eq!(Arc::strong_count(&handle), 2);

        let out = rb.consume();
        assert!(Arc::ptr_eq(&out, &handle));
        assert_eq!(Arc::strong_count(&handle), 2);
    }

    #[test]
    fn test_drop_releases_buffered_values() {
        let handle = Arc::new(0u8);
        {
            let rb: RingBuffer<Arc<u8>> = RingBuffer::new(8).unwrap();
            for _ in 0..5 {
                rb.publish(Arc::clone(&handle));
            }
            drop(rb.consume());
            assert_eq!(Arc::strong_count(&handle), 5);
        }
        assert_eq!(Arc::strong_count(&handle), 1);
    }

    #[test]
    fn test_drop_after_wraparound() {
        let handle = Arc::new(0u8);
        {
            let rb: RingBuffer<Arc<u8>> = RingBuffer::new(4).unwrap();
            for _ in 0..6 {
                rb.publish(Arc::clone(&handle));
                drop(rb.consume());
            }
            for _ in 0..3 {
                rb.publish(Arc::clone(&handle));
            }
        }
        assert_eq!(Arc::strong_count(&handle), 1);
    }

    #[test]
    fn test_debug_output() {
        let rb: RingBuffer<u64> = RingBuffer::new(8).unwrap();
        rb.publish(1);

        let out = format!("{rb:?}");
        assert!(out.contains("capacity: 8"));
        assert!(out.contains("size: 1"));
        assert!(out.contains("in_flight: 0"));
    }

    proptest! {
        #[test]
        fn prop_fifo_order(shift in 0u32..8, values in proptest::collection::vec(any::<u64>(), 0..256)) {
            let capacity = 1usize << shift;
            let rb: RingBuffer<u64> = RingBuffer::new(capacity).unwrap();

            // Publish in capacity-sized batches, drain each batch in order
            for chunk in values.chunks(capacity) {
                for &v in chunk {
                    prop_assert!(rb.try_publish(v).is_ok());
                }
                prop_assert_eq!(rb.size(), chunk.len());
                for &v in chunk {
                    prop_assert_eq!(rb.try_consume(), Some(v));
                }
                prop_assert!(rb.is_empty());
            }
        }

        #[test]
        fn prop_size_tracks_cursors(ops in proptest::collection::vec(any::<bool>(), 0..512)) {
            let rb: RingBuffer<usize> = RingBuffer::new(16).unwrap();
            let mut expected = 0usize;

            for (i, publish) in ops.into_iter().enumerate() {
                if publish {
                    if rb.try_publish(i).is_ok() {
                        expected += 1;
                    } else {
                        prop_assert_eq!(expected, 16);
                    }
                } else if rb.try_consume().is_some() {
                    expected -= 1;
                } else {
                    prop_assert_eq!(expected, 0);
                }
                prop_assert_eq!(rb.size(), expected);
                prop_assert_eq!(rb.is_full(), expected == 16);
                prop_assert_eq!(rb.is_empty(), expected == 0);
            }
        }
    }
}
