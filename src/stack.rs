//! Per-thread LIFO of free handles, plus the scavenging that pulls
//! cross-thread returns out of handoff queues.
//!
//! A stack is shared (queues and in-flight handles point at it through
//! `Arc`/`Weak`), but its hot state is confined to the owner thread: the
//! element vector, the admission counter and the scavenge cursors live
//! in a cell that only the owner touches. Foreign threads interact with
//! a stack in exactly two ways, both cheap: they splice a new queue
//! into the chain under the stack mutex, and they debit the shared
//! capacity counter.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::config::{PoolConfig, INITIAL_CAPACITY};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleState, OWN_THREAD_ID};
use crate::metrics::Metrics;
use crate::queue::HandoffQueue;
use crate::registry::{self, StackToken};

static STACK_ID: AtomicU64 = AtomicU64::new(1);

/// Owner-confined state of a stack.
pub(crate) struct StackLocal<T> {
    elements: Vec<Handle<T>>,
    /// Logical capacity: doubles under `max_capacity` the way the
    /// element array of the original grows. The vector may round its
    /// own allocation up, so the bound is tracked here.
    capacity: usize,
    /// Owner-side admission counter.
    recycle_count: u32,
    /// Scavenge resume point, so consecutive empty pops continue where
    /// the previous walk stopped instead of rescanning the chain.
    cursor: Option<Arc<HandoffQueue<T>>>,
    prev: Option<Arc<HandoffQueue<T>>>,
}

impl<T: Send + 'static> StackLocal<T> {
    fn new(interval: u32, initial_capacity: usize) -> Self {
        Self {
            elements: Vec::with_capacity(initial_capacity),
            capacity: initial_capacity,
            // Start at the interval so the first novel handle is kept.
            recycle_count: interval,
            cursor: None,
            prev: None,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.elements.len()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Double the logical capacity until it covers `expected`, capped at
    /// `max_capacity`. Returns the new capacity.
    pub(crate) fn increase_capacity(&mut self, expected: usize, max_capacity: usize) -> usize {
        let mut new_capacity = self.capacity;
        loop {
            new_capacity <<= 1;
            if new_capacity >= expected || new_capacity >= max_capacity {
                break;
            }
        }
        self.capacity = new_capacity.min(max_capacity);
        self.capacity
    }

    /// Admission filter: novel handles pass once per `interval + 1`
    /// attempts, sampled handles always pass. True means drop.
    pub(crate) fn should_drop(&mut self, state: &HandleState, interval: u32) -> bool {
        if !state.been_sampled() {
            if self.recycle_count < interval {
                self.recycle_count += 1;
                return true;
            }
            self.recycle_count = 0;
            state.mark_sampled();
        }
        false
    }

    /// Store a handle whose capacity check already happened.
    #[inline]
    pub(crate) fn push_unchecked(&mut self, handle: Handle<T>) {
        self.elements.push(handle);
    }
}

/// The per-thread reservoir of free handles.
pub(crate) struct Stack<T> {
    /// Registry key, unique per stack for the lifetime of the process.
    id: u64,
    owner_thread: ThreadId,
    /// Liveness token: foreign registries key their queue entries on a
    /// weak reference to this, so dead stacks are prunable.
    token: Arc<StackToken>,
    /// Handed to fresh and transferred handles as their home pointer.
    self_weak: Weak<Stack<T>>,
    max_capacity: usize,
    interval: u32,
    delayed_queue_interval: u32,
    max_delayed_queues: usize,
    /// Slots foreign threads may still reserve for links into this
    /// stack. Shared with every inbound queue.
    available_shared_capacity: Arc<CachePadded<AtomicUsize>>,
    /// Chain of inbound queues, published as a raw pointer owning one
    /// strong count. Producers prepend under `head_lock`; the owner
    /// walks and prunes the chain without it.
    head: AtomicPtr<HandoffQueue<T>>,
    /// Serializes `set_head` splices only; never taken by the owner.
    head_lock: Mutex<()>,
    local: UnsafeCell<StackLocal<T>>,
    metrics: Arc<Metrics>,
}

// `local` is only ever touched on the owner thread (`push` routes every
// other thread through the handoff queues); everything else is atomics,
// the release-published chain head, and immutable config.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T: Send + 'static> Stack<T> {
    /// Create a stack owned by the calling thread. `config` must be
    /// normalized.
    pub(crate) fn new(config: &PoolConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        let max_capacity = config.max_capacity_per_thread;
        Arc::new_cyclic(|self_weak| Stack {
            id: STACK_ID.fetch_add(1, Ordering::Relaxed),
            owner_thread: thread::current().id(),
            token: Arc::new(StackToken),
            self_weak: self_weak.clone(),
            max_capacity,
            interval: config.ratio,
            delayed_queue_interval: config.delayed_queue_ratio,
            max_delayed_queues: config.max_delayed_queues_per_thread,
            available_shared_capacity: Arc::new(CachePadded::new(AtomicUsize::new(
                config.shared_capacity(),
            ))),
            head: AtomicPtr::new(ptr::null_mut()),
            head_lock: Mutex::new(()),
            local: UnsafeCell::new(StackLocal::new(
                config.ratio,
                INITIAL_CAPACITY.min(max_capacity),
            )),
            metrics,
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[inline]
    pub(crate) fn interval(&self) -> u32 {
        self.interval
    }

    #[inline]
    pub(crate) fn delayed_queue_interval(&self) -> u32 {
        self.delayed_queue_interval
    }

    #[inline]
    pub(crate) fn max_delayed_queues(&self) -> usize {
        self.max_delayed_queues
    }

    #[inline]
    pub(crate) fn available_shared_capacity(&self) -> &Arc<CachePadded<AtomicUsize>> {
        &self.available_shared_capacity
    }

    #[inline]
    pub(crate) fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    #[inline]
    pub(crate) fn token(&self) -> &Arc<StackToken> {
        &self.token
    }

    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<Stack<T>> {
        self.self_weak.clone()
    }

    #[inline]
    fn is_owner(&self) -> bool {
        thread::current().id() == self.owner_thread
    }

    /// Free handles currently held. Owner thread only.
    pub(crate) fn local_len(&self) -> usize {
        debug_assert!(self.is_owner());
        // Safety: owner-confined read.
        unsafe { &*self.local.get() }.len()
    }

    /// Logical capacity of the element array. Owner thread only.
    pub(crate) fn local_capacity(&self) -> usize {
        debug_assert!(self.is_owner());
        // Safety: owner-confined read.
        unsafe { &*self.local.get() }.capacity()
    }

    /// Splice a freshly created queue in front of the chain. The new
    /// queue is not yet visible to the owner, so writing its chain
    /// pointer here is race-free; the release store publishes it.
    pub(crate) fn set_head(&self, queue: Arc<HandoffQueue<T>>) {
        let _guard = self.head_lock.lock();
        let old = self.head.load(Ordering::Relaxed);
        // The old head's count moves into the new queue's chain pointer,
        // so the pointer read below in `head_queue` never goes stale.
        let old = if old.is_null() {
            None
        } else {
            Some(unsafe { Arc::from_raw(old) })
        };
        queue.set_next(old);
        self.head.store(Arc::into_raw(queue) as *mut _, Ordering::Release);
    }

    /// Lock-free read of the chain head. The published pointer owns a
    /// strong count released only when the stack drops, and prepends
    /// keep the previous head alive through the chain, so bumping the
    /// count here cannot race with a free.
    fn head_queue(&self) -> Option<Arc<HandoffQueue<T>>> {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        unsafe {
            Arc::increment_strong_count(head);
            Some(Arc::from_raw(head))
        }
    }

    // ========== Owner-thread operations ==========

    /// Take the most recently stored handle, scavenging the handoff
    /// queues when the stack is empty. The returned handle is in flight:
    /// both its ids are zeroed.
    pub(crate) fn pop(&self) -> Option<Handle<T>> {
        debug_assert!(self.is_owner());
        // Safety: owner-confined; this is the only live borrow.
        let local = unsafe { &mut *self.local.get() };

        if local.elements.is_empty() {
            if !self.scavenge(local) {
                return None;
            }
            if local.elements.is_empty() {
                // A transfer can report progress that admission then
                // eats; check again.
                return None;
            }
        }

        let handle = local.elements.pop()?;
        let state = handle.state();
        if state.last_recycled_id() != state.recycle_id() {
            tracing::error!(
                recycle_id = state.recycle_id(),
                last_recycled_id = state.last_recycled_id(),
                "corrupt handle state during pop"
            );
            panic!("handle recycled multiple times");
        }
        state.reset_in_flight();
        Some(handle)
    }

    /// Return a handle: directly when the caller owns this stack,
    /// through a handoff queue otherwise.
    pub(crate) fn push(this: &Arc<Self>, handle: Handle<T>) -> Result<()> {
        if this.is_owner() {
            this.push_now(handle)
        } else {
            Self::push_later(this, handle);
            Ok(())
        }
    }

    fn push_now(&self, handle: Handle<T>) -> Result<()> {
        let state = handle.state();
        if state.recycle_id() != 0 || !state.claim(OWN_THREAD_ID) {
            return Err(Error::DoubleRecycle);
        }
        state.set_recycle_id(OWN_THREAD_ID);

        // Safety: owner-confined; this is the only live borrow.
        let local = unsafe { &mut *self.local.get() };

        if local.len() >= self.max_capacity {
            self.metrics.record_capacity_drop();
            return Ok(());
        }
        if local.should_drop(state, self.interval) {
            self.metrics.record_admission_drop();
            return Ok(());
        }
        if local.len() == local.capacity {
            local.capacity = (local.capacity << 1).min(self.max_capacity);
        }
        local.push_unchecked(handle);
        self.metrics.record_direct_recycle();
        Ok(())
    }

    fn push_later(this: &Arc<Self>, handle: Handle<T>) {
        if this.max_delayed_queues == 0 {
            // Cross-thread recycling disabled; drop on the floor.
            this.metrics.record_capacity_drop();
            return;
        }
        match registry::delayed_queue_for(this) {
            Some(queue) => queue.add(handle),
            None => this.metrics.record_capacity_drop(),
        }
    }

    /// Resume the queue walk; on exhaustion reset the cursor to the
    /// chain head for the next attempt.
    fn scavenge(&self, local: &mut StackLocal<T>) -> bool {
        if self.scavenge_some(local) {
            return true;
        }
        local.prev = None;
        local.cursor = self.head_queue();
        false
    }

    fn scavenge_some(&self, local: &mut StackLocal<T>) -> bool {
        let mut prev;
        let mut cursor = local.cursor.clone();
        if cursor.is_none() {
            prev = None;
            cursor = self.head_queue();
            if cursor.is_none() {
                return false;
            }
        } else {
            prev = local.prev.clone();
        }

        let mut success = false;
        while let Some(queue) = cursor {
            if queue.transfer(self, local) {
                success = true;
                cursor = Some(queue);
                break;
            }
            let next = queue.next_queue();
            if queue.producer_dead() {
                // The producer is gone: take any data it managed to
                // publish, then cut the queue out of the chain. The
                // first queue stays linked so the chain head never
                // needs owner-side synchronization.
                if queue.has_final_data() {
                    while queue.transfer(self, local) {
                        success = true;
                    }
                }
                if let Some(prev_queue) = &prev {
                    queue.reclaim_all_and_unlink();
                    prev_queue.set_next(next.clone());
                    self.metrics.record_queue_unlinked();
                }
            } else {
                prev = Some(queue);
            }
            cursor = next;
            if success {
                break;
            }
        }

        local.prev = prev;
        local.cursor = cursor;
        success
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // Release the strong count the published head pointer owns; the
        // rest of the chain unwinds through the queues' `next` pointers.
        let head = *self.head.get_mut();
        if !head.is_null() {
            drop(unsafe { Arc::from_raw(head) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_with(max_capacity: usize, ratio: u32) -> Arc<Stack<u32>> {
        let config = PoolConfig {
            max_capacity_per_thread: max_capacity,
            ratio,
            delayed_queue_ratio: ratio,
            ..Default::default()
        }
        .normalized();
        Stack::new(&config, Arc::new(Metrics::new()))
    }

    fn fresh(stack: &Arc<Stack<u32>>, value: u32) -> Handle<u32> {
        Handle::new(stack.downgrade(), value)
    }

    #[test]
    fn test_push_pop_is_lifo() {
        let stack = stack_with(64, 0);
        Stack::push(&stack, fresh(&stack, 1)).unwrap();
        Stack::push(&stack, fresh(&stack, 2)).unwrap();
        Stack::push(&stack, fresh(&stack, 3)).unwrap();

        assert_eq!(*stack.pop().unwrap().value_ref(), 3);
        assert_eq!(*stack.pop().unwrap().value_ref(), 2);
        assert_eq!(*stack.pop().unwrap().value_ref(), 1);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_pop_zeroes_recycle_ids() {
        let stack = stack_with(64, 0);
        Stack::push(&stack, fresh(&stack, 1)).unwrap();
        let handle = stack.pop().unwrap();
        assert_eq!(handle.state().recycle_id(), 0);
        assert_eq!(handle.state().last_recycled_id(), 0);
    }

    #[test]
    fn test_push_same_handle_twice_fails() {
        let stack = stack_with(64, 0);
        Stack::push(&stack, fresh(&stack, 1)).unwrap();
        let handle = stack.pop().unwrap();

        // Forge a second push without the pop that legalizes it.
        assert!(handle.state().claim(OWN_THREAD_ID));
        let result = Stack::push(&stack, handle);
        assert_eq!(result, Err(Error::DoubleRecycle));
    }

    #[test]
    fn test_owner_admission_pattern() {
        let stack = stack_with(1024, 4);
        // Counter starts at the interval: handle 0 is kept, 1..=4
        // dropped, 5 kept, 6..=9 dropped, 10 kept.
        for value in 0..11 {
            Stack::push(&stack, fresh(&stack, value)).unwrap();
        }
        assert_eq!(stack.local_len(), 3);
        assert_eq!(*stack.pop().unwrap().value_ref(), 10);
        assert_eq!(*stack.pop().unwrap().value_ref(), 5);
        assert_eq!(*stack.pop().unwrap().value_ref(), 0);
    }

    #[test]
    fn test_sampled_handles_always_admitted() {
        let stack = stack_with(1024, 8);
        Stack::push(&stack, fresh(&stack, 1)).unwrap();
        assert_eq!(stack.local_len(), 1);

        // Round-trip the same handle; once sampled it is never dropped.
        for _ in 0..20 {
            let handle = stack.pop().unwrap();
            Stack::push(&stack, handle).unwrap();
        }
        assert_eq!(stack.local_len(), 1);
    }

    #[test]
    fn test_capacity_bound_drops_youngest() {
        let stack = stack_with(8, 0);
        for value in 0..20 {
            Stack::push(&stack, fresh(&stack, value)).unwrap();
        }
        assert_eq!(stack.local_len(), 8);
        assert_eq!(stack.metrics().snapshot().drops_capacity, 12);
        // The youngest retained handle is the eighth push.
        assert_eq!(*stack.pop().unwrap().value_ref(), 7);
    }

    #[test]
    fn test_capacity_doubles_under_cap() {
        let config = PoolConfig {
            max_capacity_per_thread: 4096,
            ratio: 0,
            ..Default::default()
        }
        .normalized();
        let stack: Arc<Stack<u32>> = Stack::new(&config, Arc::new(Metrics::new()));
        assert_eq!(stack.local_capacity(), INITIAL_CAPACITY);

        // Safety in tests: single thread, owner access.
        let local = unsafe { &mut *stack.local.get() };
        assert_eq!(local.increase_capacity(300, 4096), 512);
        assert_eq!(local.increase_capacity(5000, 4096), 4096);
    }

    #[test]
    fn test_initial_capacity_capped_by_max() {
        let stack = stack_with(32, 0);
        assert_eq!(stack.local_capacity(), 32);
    }
}
