//! Fixed-capacity segment of a handoff queue.
//!
//! Exactly one thread (the foreign producer) writes slots and exactly
//! one thread (the home stack's owner) reads them. The write count is
//! the publication point: the producer stores a slot, then
//! release-stores the incremented count; the consumer acquire-loads the
//! count before touching any slot below it.

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam::utils::CachePadded;

use crate::config::link_capacity;
use crate::handle::Handle;

/// Slot invariants: `[0, read_index)` consumed, `[read_index,
/// write_count)` live and readable by the consumer, the rest untouched.
pub(crate) struct Link<T> {
    /// Published slot count. Padded away from the consumer-side index.
    write_count: CachePadded<AtomicUsize>,
    /// Next unconsumed slot. Consumer only.
    read_index: Cell<usize>,
    /// Successor segment, set once by the producer when this one fills.
    next: OnceLock<Arc<Link<T>>>,
    slots: Box<[UnsafeCell<MaybeUninit<Handle<T>>>]>,
}

// One producer writes `slots`/`write_count`, one consumer reads them
// behind the acquire-load of `write_count`; `read_index` is consumer
// only. The queue owning this link upholds that discipline.
unsafe impl<T: Send> Send for Link<T> {}
unsafe impl<T: Send> Sync for Link<T> {}

impl<T: Send + 'static> Link<T> {
    pub(crate) fn new() -> Self {
        let capacity = link_capacity();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            write_count: CachePadded::new(AtomicUsize::new(0)),
            read_index: Cell::new(0),
            next: OnceLock::new(),
            slots: slots.into_boxed_slice(),
        }
    }

    /// Published slot count, with the handle stores ordered before it.
    #[inline]
    pub(crate) fn write_count(&self) -> usize {
        self.write_count.load(Ordering::Acquire)
    }

    /// Producer-side read of its own index.
    #[inline]
    pub(crate) fn write_count_relaxed(&self) -> usize {
        self.write_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn read_index(&self) -> usize {
        self.read_index.get()
    }

    #[inline]
    pub(crate) fn set_read_index(&self, index: usize) {
        self.read_index.set(index);
    }

    #[inline]
    pub(crate) fn next_link(&self) -> Option<Arc<Link<T>>> {
        self.next.get().cloned()
    }

    /// Chain a successor. The single producer calls this once per link,
    /// after which it never writes this link again.
    pub(crate) fn set_next_link(&self, link: Arc<Link<T>>) {
        let _ = self.next.set(link);
    }

    /// Store `handle` at `index` and publish it.
    ///
    /// # Safety
    ///
    /// Caller is the link's single producer and `index` equals the
    /// current write count, below capacity.
    #[inline]
    pub(crate) unsafe fn publish(&self, index: usize, handle: Handle<T>) {
        unsafe { (*self.slots[index].get()).write(handle) };
        // The slot store must be visible before the index store.
        self.write_count.store(index + 1, Ordering::Release);
    }

    /// Move the handle out of `index`.
    ///
    /// # Safety
    ///
    /// Caller is the link's single consumer, `index` lies in
    /// `[read_index, write_count())` under an acquire-observed count,
    /// and each slot is consumed at most once.
    #[inline]
    pub(crate) unsafe fn consume(&self, index: usize) -> Handle<T> {
        unsafe { (*self.slots[index].get()).assume_init_read() }
    }
}

impl<T> Drop for Link<T> {
    fn drop(&mut self) {
        // Unconsumed slots still own their handles.
        let start = self.read_index.get();
        let end = *self.write_count.get_mut();
        for slot in &mut self.slots[start..end] {
            unsafe { slot.get_mut().assume_init_drop() };
        }
    }
}
