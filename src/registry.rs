//! Thread-local registries backing the pool.
//!
//! Each thread carries one context: a liveness guard, the thread's home
//! stacks (one per pool, lazily created), and the handoff queues it
//! produces into for foreign stacks. Both maps die with the thread;
//! dropping the guard is what lets stack owners observe that a producer
//! is gone, and dropping the stack map is what ends the thread's stacks.
//!
//! The queue map plays the role of a weak-keyed map: each entry carries
//! a weak reference to the stack's liveness token, and entries whose
//! stack died are pruned when the map hits its bound, so a dead stack
//! never pins a queue slot forever.

use std::any::Any;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use crate::queue::HandoffQueue;
use crate::stack::Stack;

/// Liveness token of one thread. Queues hold a weak reference to the
/// producing thread's guard.
pub(crate) struct ThreadGuard;

/// Liveness token of one stack; the weak key of the queue registry.
pub(crate) struct StackToken;

/// Registry slot for one foreign stack. `queue` is `None` for the dummy
/// entry installed once the registry is full, so later recycles toward
/// that stack drop without re-checking the bound.
struct DelayedEntry {
    stack: Weak<StackToken>,
    queue: Option<Box<dyn Any>>,
}

struct ThreadContext {
    guard: Arc<ThreadGuard>,
    /// Home stacks of this thread, keyed by pool id.
    stacks: RefCell<FxHashMap<u64, Box<dyn Any>>>,
    /// Handoff queues toward foreign stacks, keyed by stack id.
    delayed: RefCell<FxHashMap<u64, DelayedEntry>>,
}

impl ThreadContext {
    fn new() -> Self {
        Self {
            guard: Arc::new(ThreadGuard),
            stacks: RefCell::new(FxHashMap::default()),
            delayed: RefCell::new(FxHashMap::default()),
        }
    }
}

thread_local! {
    static CONTEXT: ThreadContext = ThreadContext::new();
}

/// The calling thread's home stack for `pool_id`, created through `init`
/// on first use. Returns `None` once thread-local storage is torn down.
pub(crate) fn home_stack<T, F>(pool_id: u64, init: F) -> Option<Arc<Stack<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Arc<Stack<T>>,
{
    CONTEXT
        .try_with(|ctx| {
            let mut stacks = ctx.stacks.borrow_mut();
            if let Some(existing) = stacks.get(&pool_id) {
                return existing
                    .downcast_ref::<Arc<Stack<T>>>()
                    .expect("pool id bound to a different stack type")
                    .clone();
            }
            let stack = init();
            stacks.insert(pool_id, Box::new(stack.clone()));
            stack
        })
        .ok()
}

/// The calling thread's handoff queue toward `stack`, creating one when
/// the registry has room and the stack's shared budget allows it.
/// `None` means the handle should be dropped: the registry is full (the
/// dummy entry), the budget is spent, or the thread is tearing down.
pub(crate) fn delayed_queue_for<T: Send + 'static>(
    stack: &Arc<Stack<T>>,
) -> Option<Arc<HandoffQueue<T>>> {
    CONTEXT
        .try_with(|ctx| {
            let mut delayed = ctx.delayed.borrow_mut();
            if let Some(entry) = delayed.get(&stack.id()) {
                return entry
                    .queue
                    .as_ref()
                    .and_then(|queue| queue.downcast_ref::<Arc<HandoffQueue<T>>>())
                    .cloned();
            }

            if delayed.len() >= stack.max_delayed_queues() {
                prune_dead(&mut delayed);
                if delayed.len() >= stack.max_delayed_queues() {
                    // Mark the stack with the dummy so later recycles
                    // toward it drop cheaply.
                    delayed.insert(
                        stack.id(),
                        DelayedEntry {
                            stack: Arc::downgrade(stack.token()),
                            queue: None,
                        },
                    );
                    return None;
                }
            }

            let queue = HandoffQueue::new(stack, Arc::downgrade(&ctx.guard))?;
            delayed.insert(
                stack.id(),
                DelayedEntry {
                    stack: Arc::downgrade(stack.token()),
                    queue: Some(Box::new(queue.clone())),
                },
            );
            Some(queue)
        })
        .ok()
        .flatten()
}

/// Drop entries whose stack no longer exists.
fn prune_dead(delayed: &mut FxHashMap<u64, DelayedEntry>) {
    delayed.retain(|_, entry| entry.stack.strong_count() > 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::metrics::Metrics;

    fn stack_with(max_delayed: usize) -> Arc<Stack<u32>> {
        let config = PoolConfig {
            max_capacity_per_thread: 1024,
            max_delayed_queues_per_thread: max_delayed,
            ratio: 0,
            delayed_queue_ratio: 0,
            ..Default::default()
        }
        .normalized();
        Stack::new(&config, Arc::new(Metrics::new()))
    }

    #[test]
    fn test_home_stack_is_cached_per_pool() {
        let a = home_stack(7_001, || stack_with(8)).unwrap();
        let b = home_stack(7_001, || stack_with(8)).unwrap();
        let c = home_stack(7_002, || stack_with(8)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_delayed_queue_reused_per_stack() {
        let stack = stack_with(64);
        let first = delayed_queue_for(&stack).expect("queue created");
        let second = delayed_queue_for(&stack).expect("queue reused");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_registry_bound_installs_dummy() {
        // Two stacks with a bound of one queue: the second lookup must
        // hit the dummy path and keep doing so.
        let first = stack_with(1);
        let second = stack_with(1);
        assert!(delayed_queue_for(&first).is_some());
        assert!(delayed_queue_for(&second).is_none());
        assert!(delayed_queue_for(&second).is_none());
        // The first stack's queue is unaffected.
        assert!(delayed_queue_for(&first).is_some());
    }

    #[test]
    fn test_dead_stack_entries_are_pruned() {
        let doomed = stack_with(1);
        assert!(delayed_queue_for(&doomed).is_some());
        drop(doomed);

        // The registry is at its bound, but the dead entry gives way.
        let survivor = stack_with(1);
        assert!(delayed_queue_for(&survivor).is_some());
    }
}
