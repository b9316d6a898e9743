//! Fixed pool of reusable slots moving between a "usable" and an "unread" queue.
//!
//! # Slot Ownership
//!
//! Every slot is at any instant in exactly one of four places:
//!
//! 1. the `usable` queue (free for a writer),
//! 2. the `unread` queue (published, waiting for a reader),
//! 3. a [`WriteSlot`] held by a writer,
//! 4. a read guard held for the duration of a read callback.
//!
//! Slots are boxed and moved between the lock-free queues, so ownership is
//! enforced by the move itself and never by a lock inside the slot. Both guards
//! return their slot on drop, which keeps the slot count constant even when a
//! writer abandons a slot or a read callback panics.
//!
//! # Overwrite Policy
//!
//! When `usable` is empty, [`RingBuffer::acquire_for_write`] either recycles
//! the oldest unread slot (keep-fresh, counted as a missed read) or returns
//! `None` (counted as a failed write). Missed reads are a count only; the
//! buffer does not record which item was dropped.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use crate::CancelToken;

/// Bounded wait between polls in [`RingBuffer::blocking_read`].
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

type FactoryFn<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Errors raised when constructing a ring buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    /// A ring needs at least one slot for the writer and one for the reader.
    #[error("ring buffer capacity must be at least 2, got {0}")]
    CapacityTooSmall(usize),
}

/// Write half of a ring buffer, handed to hardware layers.
pub trait RingBufferWrite<T>: Send + Sync {
    /// Take a slot to fill, or `None` when none is available under the
    /// current policy.
    fn acquire_for_write(&self) -> Option<WriteSlot<'_, T>>;
}

/// Fixed-capacity buffer of reusable `T` slots.
pub struct RingBuffer<T> {
    usable: SegQueue<Box<T>>,
    unread: SegQueue<Box<T>>,
    factory: FactoryFn<T>,
    capacity: AtomicUsize,
    keep_fresh: AtomicBool,
    failed_writes: AtomicU64,
    missed_reads: AtomicU64,
    published: Mutex<bool>,
    data_ready: Condvar,
}

impl<T: Send + 'static> RingBuffer<T> {
    /// Create a ring with `capacity` slots built by `factory`.
    ///
    /// Keep-fresh is disabled initially.
    pub fn new<F>(capacity: usize, factory: F) -> Result<Arc<Self>, RingBufferError>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        if capacity < 2 {
            return Err(RingBufferError::CapacityTooSmall(capacity));
        }
        let usable = SegQueue::new();
        for _ in 0..capacity {
            usable.push(Box::new(factory()));
        }
        Ok(Arc::new(Self {
            usable,
            unread: SegQueue::new(),
            factory: Box::new(factory),
            capacity: AtomicUsize::new(capacity),
            keep_fresh: AtomicBool::new(false),
            failed_writes: AtomicU64::new(0),
            missed_reads: AtomicU64::new(0),
            published: Mutex::new(false),
            data_ready: Condvar::new(),
        }))
    }

    /// Create a keep-fresh ring.
    pub fn new_keep_fresh<F>(capacity: usize, factory: F) -> Result<Arc<Self>, RingBufferError>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let ring = Self::new(capacity, factory)?;
        ring.set_keep_fresh(true);
        Ok(ring)
    }

    /// Add `additional` fresh slots to the usable set.
    pub fn increase_capacity(&self, additional: usize) {
        for _ in 0..additional {
            self.usable.push(Box::new((self.factory)()));
        }
        let capacity = self.capacity.fetch_add(additional, Ordering::AcqRel) + additional;
        trace!(capacity, additional, "ring buffer grown");
    }
}

impl<T> RingBuffer<T> {
    /// Take a slot to fill.
    ///
    /// Pops a usable slot; when none is left, recycles the oldest unread slot
    /// if keep-fresh is on (incrementing [`missed_reads`](Self::missed_reads)),
    /// otherwise returns `None` and increments
    /// [`failed_writes`](Self::failed_writes).
    pub fn acquire_for_write(&self) -> Option<WriteSlot<'_, T>> {
        if let Some(slot) = self.usable.pop() {
            return Some(WriteSlot::new(self, slot));
        }
        if self.keep_fresh() {
            if let Some(slot) = self.unread.pop() {
                self.missed_reads.fetch_add(1, Ordering::Relaxed);
                return Some(WriteSlot::new(self, slot));
            }
        }
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Read the oldest unread slot without blocking.
    ///
    /// The slot goes back to the usable set after `f` returns, including when
    /// `f` unwinds.
    pub fn try_read<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.take_unread()?;
        let slot = guard.slot.as_deref_mut()?;
        Some(f(slot))
    }

    /// Read the oldest unread slot, waiting for one to be published.
    ///
    /// Waits in bounded steps of [`READ_POLL_INTERVAL`]. Returns `None` only
    /// when `cancel` fires.
    pub fn blocking_read<R>(&self, f: impl FnOnce(&mut T) -> R, cancel: &CancelToken) -> Option<R> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(mut guard) = self.take_unread() {
                let slot = guard.slot.as_deref_mut()?;
                return Some(f(slot));
            }
            self.wait_for_publish(READ_POLL_INTERVAL);
        }
    }

    /// Read the oldest unread slot, waiting at most `timeout` for one.
    pub fn read_timeout<R>(&self, f: impl FnOnce(&mut T) -> R, timeout: Duration) -> Option<R> {
        let mut guard = match self.take_unread() {
            Some(guard) => guard,
            None => {
                self.wait_for_publish(timeout);
                self.take_unread()?
            }
        };
        let slot = guard.slot.as_deref_mut()?;
        Some(f(slot))
    }

    /// Drop every unread slot back into the usable set. Returns how many.
    pub fn discard_unread(&self) -> usize {
        let mut discarded = 0;
        while let Some(slot) = self.unread.pop() {
            self.usable.push(slot);
            discarded += 1;
        }
        discarded
    }

    /// Whether writers may overwrite unread data when the ring is full.
    #[must_use]
    pub fn keep_fresh(&self) -> bool {
        self.keep_fresh.load(Ordering::Relaxed)
    }

    /// Change the overwrite policy.
    pub fn set_keep_fresh(&self, keep_fresh: bool) {
        self.keep_fresh.store(keep_fresh, Ordering::Relaxed);
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Published slots waiting for a reader.
    #[must_use]
    pub fn unread_len(&self) -> usize {
        self.unread.len()
    }

    /// Slots free for writers.
    #[must_use]
    pub fn usable_len(&self) -> usize {
        self.usable.len()
    }

    /// Writes rejected because no slot was available.
    #[must_use]
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Unread slots recycled by keep-fresh writes.
    #[must_use]
    pub fn missed_reads(&self) -> u64 {
        self.missed_reads.load(Ordering::Relaxed)
    }

    /// Zero the failed-write counter, returning its previous value.
    pub fn reset_failed_writes(&self) -> u64 {
        self.failed_writes.swap(0, Ordering::Relaxed)
    }

    /// Zero the missed-read counter, returning its previous value.
    pub fn reset_missed_reads(&self) -> u64 {
        self.missed_reads.swap(0, Ordering::Relaxed)
    }

    fn take_unread(&self) -> Option<ReadGuard<'_, T>> {
        self.unread.pop().map(|slot| ReadGuard {
            ring: self,
            slot: Some(slot),
        })
    }

    fn publish_slot(&self, slot: Box<T>) {
        self.unread.push(slot);
        let mut published = self.published.lock();
        *published = true;
        self.data_ready.notify_one();
    }

    fn wait_for_publish(&self, timeout: Duration) {
        let mut published = self.published.lock();
        if !*published {
            self.data_ready.wait_for(&mut published, timeout);
        }
        *published = false;
    }
}

impl<T: Send> RingBufferWrite<T> for RingBuffer<T> {
    fn acquire_for_write(&self) -> Option<WriteSlot<'_, T>> {
        RingBuffer::acquire_for_write(self)
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("usable", &self.usable_len())
            .field("unread", &self.unread_len())
            .field("keep_fresh", &self.keep_fresh())
            .field("failed_writes", &self.failed_writes())
            .field("missed_reads", &self.missed_reads())
            .finish()
    }
}

/// Acquire a slot, fill it with `copier(input, slot)` and publish it.
///
/// Returns `false` when no slot was available; the drop is already counted by
/// the ring.
pub fn try_copy_in<T, I, W>(ring: &W, copier: impl FnOnce(&I, &mut T), input: &I) -> bool
where
    I: ?Sized,
    W: RingBufferWrite<T> + ?Sized,
{
    match ring.acquire_for_write() {
        Some(mut slot) => {
            copier(input, &mut slot);
            slot.publish();
            true
        }
        None => false,
    }
}

/// A slot held by a writer.
///
/// Call [`WriteSlot::publish`] to hand it to readers. Dropping it unpublished
/// returns the slot to the usable set.
#[must_use = "a write slot is returned unpublished when dropped"]
pub struct WriteSlot<'a, T> {
    ring: &'a RingBuffer<T>,
    slot: Option<Box<T>>,
}

impl<'a, T> WriteSlot<'a, T> {
    fn new(ring: &'a RingBuffer<T>, slot: Box<T>) -> Self {
        Self {
            ring,
            slot: Some(slot),
        }
    }

    /// Queue the slot for readers and wake a blocked reader.
    pub fn publish(mut self) {
        if let Some(slot) = self.slot.take() {
            self.ring.publish_slot(slot);
        }
    }
}

impl<T> Deref for WriteSlot<'_, T> {
    type Target = T;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &T {
        // Only `publish` and `drop` take the slot, and both consume the guard.
        self.slot.as_deref().expect("write slot accessed after publish")
    }
}

impl<T> DerefMut for WriteSlot<'_, T> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut T {
        self.slot
            .as_deref_mut()
            .expect("write slot accessed after publish")
    }
}

impl<T> Drop for WriteSlot<'_, T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.ring.usable.push(slot);
        }
    }
}

struct ReadGuard<'a, T> {
    ring: &'a RingBuffer<T>,
    slot: Option<Box<T>>,
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.ring.usable.push(slot);
        }
    }
}
