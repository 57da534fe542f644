//! User-facing pool facade.
//!
//! A `Pool` binds a factory to one per-thread stack per calling thread.
//! Cloning the pool is cheap and shares the same stacks, metrics and
//! configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::PoolConfig;
use crate::handle::{Handle, Pooled};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry;
use crate::stack::Stack;

static POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolShared<T: Send + 'static> {
    id: u64,
    config: PoolConfig,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    metrics: Arc<Metrics>,
}

/// Thread-local object pool with cross-thread recycling.
///
/// `get` serves from the calling thread's stack, falling back to the
/// handoff queues and finally to the factory. Values return to their
/// home stack on drop of the [`Pooled`] wrapper, directly when dropped
/// on the owning thread and through a per-thread handoff queue
/// otherwise. Reuse is best effort: returns may be dropped by the
/// admission filter or a capacity bound, which only costs a fresh
/// allocation later.
pub struct Pool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Pool with default configuration.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_config(PoolConfig::default(), factory)
    }

    /// Pool with explicit tunables.
    pub fn with_config<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let config = config.normalized();
        debug!(
            max_capacity_per_thread = config.max_capacity_per_thread,
            max_shared_capacity_factor = config.max_shared_capacity_factor,
            ratio = config.ratio,
            max_delayed_queues_per_thread = config.max_delayed_queues_per_thread,
            delayed_queue_ratio = config.delayed_queue_ratio,
            "created object pool"
        );
        Self {
            shared: Arc::new(PoolShared {
                id: POOL_ID.fetch_add(1, Ordering::Relaxed),
                config,
                factory: Box::new(factory),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    /// Borrow an object: pooled when the calling thread's stack (or its
    /// handoff queues) has one, freshly constructed otherwise.
    pub fn get(&self) -> Pooled<T> {
        let shared = &self.shared;
        let Some(stack) = self.local_stack() else {
            // Pooling disabled, or the calling thread is tearing down.
            shared.metrics.record_fresh_get();
            return Pooled::unpooled((shared.factory)(), shared.id);
        };
        match stack.pop() {
            Some(handle) => {
                shared.metrics.record_pooled_get();
                Pooled::from_handle(handle, shared.id)
            }
            None => {
                let value = (shared.factory)();
                shared.metrics.record_fresh_get();
                Pooled::from_handle(Handle::new(stack.downgrade(), value), shared.id)
            }
        }
    }

    /// Recycle through the pool instead of the wrapper. Returns false
    /// without touching anything when the handle was not issued by this
    /// pool, is backed by the no-op state, or was already recycled.
    pub fn recycle(&self, item: &mut Pooled<T>) -> bool {
        if item.pool_id() != self.shared.id || item.is_unpooled() {
            return false;
        }
        item.recycle().is_ok()
    }

    /// Snapshot of this pool's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Free handles on the calling thread's stack.
    pub fn local_size(&self) -> usize {
        self.local_stack().map_or(0, |stack| stack.local_len())
    }

    /// Logical capacity of the calling thread's stack.
    pub fn local_capacity(&self) -> usize {
        self.local_stack().map_or(0, |stack| stack.local_capacity())
    }

    /// The calling thread's stack, created on first use. `None` when
    /// pooling is disabled or thread-local storage is gone.
    pub(crate) fn local_stack(&self) -> Option<Arc<Stack<T>>> {
        if self.shared.config.max_capacity_per_thread == 0 {
            return None;
        }
        let shared = self.shared.clone();
        registry::home_stack(self.shared.id, move || {
            Stack::new(&shared.config, shared.metrics.clone())
        })
    }
}
