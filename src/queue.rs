//! Cross-thread handoff queue: a singly-linked list of link segments
//! carrying recycled handles from one foreign producer thread back to
//! one home stack.
//!
//! Each queue has exactly one producer (the foreign thread that owns it
//! through its thread-local registry) and one consumer (the home
//! stack's owner). The producer and consumer halves live in separate
//! cells and never share mutable state; the only cross-thread word is
//! each link's write count. The queue deliberately holds no reference
//! to its home stack, only the stack's shared-capacity counter, so a
//! dead stack is reclaimable while foreign threads still hold the
//! queue.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;
use tracing::trace;

use crate::config::link_capacity;
use crate::handle::{next_recycler_id, Handle};
use crate::link::Link;
use crate::metrics::Metrics;
use crate::registry::ThreadGuard;
use crate::stack::{Stack, StackLocal};

/// Subtract one link's worth of slots from the shared budget, refusing
/// rather than underflowing. Relaxed: this is an allocation budget, no
/// data is published through it.
fn reserve_link_capacity(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |available| {
            available.checked_sub(link_capacity())
        })
        .is_ok()
}

/// Producer half: only the registering thread touches this.
struct ProducerSide<T> {
    tail: Arc<Link<T>>,
    /// Enqueue-side admission counter.
    recycle_count: u32,
}

/// Consumer half: only the home stack's owner touches this.
struct ConsumerSide<T> {
    head: Option<Arc<Link<T>>>,
}

pub(crate) struct HandoffQueue<T> {
    /// Recycle-path identity stamped into handles claimed by this queue.
    id: u32,
    /// Producer thread liveness; once dead, the consumer drains what
    /// was published and unlinks the queue.
    producer: Weak<ThreadGuard>,
    interval: u32,
    /// The home stack's shared-capacity account.
    available: Arc<CachePadded<AtomicUsize>>,
    producer_side: UnsafeCell<ProducerSide<T>>,
    consumer_side: UnsafeCell<ConsumerSide<T>>,
    /// Next queue in the home stack's chain. Written once before the
    /// queue is published and thereafter only by the consumer.
    next: UnsafeCell<Option<Arc<HandoffQueue<T>>>>,
    metrics: Arc<Metrics>,
}

// The producer cell is confined to the thread holding the queue in its
// registry, the consumer cell and `next` to the stack owner; see the
// per-method safety notes.
unsafe impl<T: Send> Send for HandoffQueue<T> {}
unsafe impl<T: Send> Sync for HandoffQueue<T> {}

impl<T: Send + 'static> HandoffQueue<T> {
    /// Allocate a queue for `stack`, reserving one link's worth of
    /// shared capacity up front, and splice it into the stack's chain.
    /// Returns `None` when the budget is spent.
    pub(crate) fn new(stack: &Arc<Stack<T>>, producer: Weak<ThreadGuard>) -> Option<Arc<Self>> {
        let available = stack.available_shared_capacity().clone();
        if !reserve_link_capacity(&available) {
            return None;
        }
        let first = Arc::new(Link::new());
        let interval = stack.delayed_queue_interval();
        let queue = Arc::new(Self {
            id: next_recycler_id(),
            producer,
            interval,
            available,
            producer_side: UnsafeCell::new(ProducerSide {
                tail: first.clone(),
                // Start at the interval so the first novel handle is kept.
                recycle_count: interval,
            }),
            consumer_side: UnsafeCell::new(ConsumerSide { head: Some(first) }),
            next: UnsafeCell::new(None),
            metrics: stack.metrics().clone(),
        });
        stack.set_head(queue.clone());
        queue.metrics.record_queue_created();
        trace!(queue_id = queue.id, "created handoff queue");
        Some(queue)
    }

    #[inline]
    pub(crate) fn producer_dead(&self) -> bool {
        self.producer.upgrade().is_none()
    }

    #[inline]
    fn refund(&self, slots: usize) {
        self.available.fetch_add(slots, Ordering::Relaxed);
    }

    // ========== Producer side ==========

    /// Enqueue a recycled handle. Drops it when another recycle path
    /// already claimed it, when the admission filter says no, or when a
    /// new link cannot be reserved.
    pub(crate) fn add(&self, mut handle: Handle<T>) {
        if !handle.state().claim(self.id) {
            // Lost the claim; the handle is accounted for elsewhere.
            return;
        }

        // Safety: only the thread registered for this queue calls `add`.
        let producer = unsafe { &mut *self.producer_side.get() };

        // Filter early, before the handle occupies a slot; otherwise the
        // queue grows unchecked between transfers.
        if !handle.state().been_sampled() {
            if producer.recycle_count < self.interval {
                producer.recycle_count += 1;
                self.metrics.record_admission_drop();
                return;
            }
            producer.recycle_count = 0;
            handle.state().mark_sampled();
        }

        let mut write = producer.tail.write_count_relaxed();
        if write == link_capacity() {
            if !reserve_link_capacity(&self.available) {
                self.metrics.record_capacity_drop();
                return;
            }
            let link = Arc::new(Link::new());
            producer.tail.set_next_link(link.clone());
            producer.tail = link;
            write = 0;
        }

        // The handle leaves the stack's ownership until a transfer
        // re-binds it.
        handle.detach_home();
        // Safety: single producer, and `write` is this link's count.
        unsafe { producer.tail.publish(write, handle) };
        self.metrics.record_queued_recycle();
    }

    // ========== Consumer side ==========

    /// Move as many handles as fit from the head link into `dst`.
    /// Returns true iff the stack grew.
    pub(crate) fn transfer(&self, dst: &Stack<T>, local: &mut StackLocal<T>) -> bool {
        // Safety: only the stack owner calls consumer methods.
        let consumer = unsafe { &mut *self.consumer_side.get() };
        let Some(mut head) = consumer.head.clone() else {
            return false;
        };

        if head.read_index() == link_capacity() {
            let Some(next) = head.next_link() else {
                return false;
            };
            self.refund(link_capacity());
            consumer.head = Some(next.clone());
            head = next;
        }

        let src_start = head.read_index();
        let mut src_end = head.write_count();
        if src_end == src_start {
            return false;
        }

        let src_size = src_end - src_start;
        let dst_size = local.len();
        let expected = dst_size + src_size;
        if expected > local.capacity() {
            let actual = local.increase_capacity(expected, dst.max_capacity());
            src_end = src_end.min(src_start + actual - dst_size);
        }
        if src_start == src_end {
            // Destination stack is already full.
            return false;
        }

        let mut moved = false;
        for index in src_start..src_end {
            // Safety: single consumer, and `index` is below the
            // acquire-observed write count.
            let mut handle = unsafe { head.consume(index) };

            let last = handle.state().last_recycled_id();
            let recycle = handle.state().recycle_id();
            if recycle == 0 {
                handle.state().set_recycle_id(last);
            } else if recycle != last {
                tracing::error!(
                    recycle_id = recycle,
                    last_recycled_id = last,
                    "corrupt handle state during transfer"
                );
                panic!("handle recycled multiple times");
            }

            if local.should_drop(handle.state(), dst.interval()) {
                self.metrics.record_admission_drop();
                continue;
            }
            handle.rebind_home(dst.downgrade());
            local.push_unchecked(handle);
            moved = true;
        }

        if src_end == link_capacity() {
            if let Some(next) = head.next_link() {
                // The drained link's reservation comes back as it goes.
                self.refund(link_capacity());
                consumer.head = Some(next);
            }
        }

        head.set_read_index(src_end);
        if moved {
            self.metrics.record_transfer();
        }
        moved
    }

    /// Whether any published slot is still unconsumed. Used on dead
    /// producers before unlinking; the acquire loads make the last
    /// published slots visible.
    pub(crate) fn has_final_data(&self) -> bool {
        // Safety: only the stack owner calls consumer methods.
        let consumer = unsafe { &*self.consumer_side.get() };
        let Some(mut link) = consumer.head.clone() else {
            return false;
        };
        let mut read = link.read_index();
        loop {
            if read < link.write_count() {
                return true;
            }
            match link.next_link() {
                Some(next) => {
                    link = next;
                    read = 0;
                }
                None => return false,
            }
        }
    }

    /// Refund every link still held and sever the chain. Returns the
    /// number of refunded slots.
    pub(crate) fn reclaim_all_and_unlink(&self) -> usize {
        // Safety: only the stack owner calls consumer methods, and only
        // after observing the producer dead.
        let consumer = unsafe { &mut *self.consumer_side.get() };
        let mut reclaimed = 0;
        let mut link = consumer.head.take();
        while let Some(current) = link {
            reclaimed += link_capacity();
            link = current.next_link();
        }
        if reclaimed > 0 {
            self.refund(reclaimed);
        }
        self.set_next(None);
        trace!(queue_id = self.id, reclaimed, "reclaimed handoff queue");
        reclaimed
    }

    /// Next queue in the stack's chain.
    #[inline]
    pub(crate) fn next_queue(&self) -> Option<Arc<HandoffQueue<T>>> {
        // Safety: consumer-only read; the pre-publication write is
        // ordered by the stack's release-published chain head.
        unsafe { &*self.next.get() }.clone()
    }

    /// Replace the chain pointer. Called by the splicing producer
    /// before this queue is published through the stack's chain head,
    /// and by the consumer when unlinking a successor.
    pub(crate) fn set_next(&self, next: Option<Arc<HandoffQueue<T>>>) {
        unsafe { *self.next.get() = next };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::registry::ThreadGuard;

    fn test_stack(max_capacity: usize, ratio: u32) -> Arc<Stack<u32>> {
        let config = PoolConfig {
            max_capacity_per_thread: max_capacity,
            ratio,
            delayed_queue_ratio: ratio,
            ..Default::default()
        }
        .normalized();
        Stack::new(&config, Arc::new(Metrics::new()))
    }

    #[test]
    fn test_reserve_refuses_below_one_link() {
        let counter = AtomicUsize::new(link_capacity() + 1);
        assert!(reserve_link_capacity(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(!reserve_link_capacity(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_queue_creation_reserves_one_link() {
        let stack = test_stack(1024, 0);
        let budget = stack.available_shared_capacity().load(Ordering::Relaxed);
        let guard = Arc::new(ThreadGuard);
        let _queue = HandoffQueue::new(&stack, Arc::downgrade(&guard)).expect("budget available");
        assert_eq!(
            stack.available_shared_capacity().load(Ordering::Relaxed),
            budget - link_capacity()
        );
    }

    #[test]
    fn test_add_then_transfer_preserves_order() {
        let stack = test_stack(1024, 0);
        let guard = Arc::new(ThreadGuard);
        let queue = HandoffQueue::new(&stack, Arc::downgrade(&guard)).expect("budget available");

        for value in 0..5u32 {
            queue.add(Handle::new(stack.downgrade(), value));
        }

        // The owner scavenges through pop; values come back LIFO over
        // the queue-ordered batch.
        for expected in (0..5u32).rev() {
            let handle = stack.pop().expect("queued handle");
            assert_eq!(*handle.value_ref(), expected);
        }
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_claimed_handle_is_dropped_not_enqueued() {
        let stack = test_stack(1024, 0);
        let guard = Arc::new(ThreadGuard);
        let queue = HandoffQueue::new(&stack, Arc::downgrade(&guard)).expect("budget available");

        let handle = Handle::new(stack.downgrade(), 9u32);
        assert!(handle.state().claim(999));
        queue.add(handle);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_enqueue_side_admission_filter() {
        let stack = test_stack(1024, 2);
        let guard = Arc::new(ThreadGuard);
        let queue = HandoffQueue::new(&stack, Arc::downgrade(&guard)).expect("budget available");

        // Counter starts at the interval: the first novel handle is
        // kept, the next `interval` are dropped, then one is kept again.
        for value in 0..6u32 {
            queue.add(Handle::new(stack.downgrade(), value));
        }
        let first = stack.pop().expect("first admitted handle");
        let second = stack.pop().expect("second admitted handle");
        assert_eq!(*second.value_ref(), 0);
        assert_eq!(*first.value_ref(), 3);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_capacity_denied_drops_overflow() {
        // Budget floored at one link: the queue's own link consumes it
        // all, so filling past one link drops the overflow.
        let stack = test_stack(link_capacity() * 2, 0);
        let guard = Arc::new(ThreadGuard);
        let queue = HandoffQueue::new(&stack, Arc::downgrade(&guard)).expect("budget available");
        assert_eq!(stack.available_shared_capacity().load(Ordering::Relaxed), 0);

        let total = link_capacity() + 4;
        for value in 0..total as u32 {
            queue.add(Handle::new(stack.downgrade(), value));
        }

        let mut drained = 0;
        while stack.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, link_capacity());
        assert_eq!(stack.metrics().snapshot().drops_capacity, 4);
    }
}
