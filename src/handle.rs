//! Per-object bookkeeping that carries a pooled value back to its home
//! stack.
//!
//! A handle pairs the user's value with a small block of shared state:
//! which recycle path last returned it, whether it has passed the
//! admission filter, and a weak pointer to the stack it belongs to. The
//! value travels with its handle as an owned box, so identity is stable
//! across any number of get/recycle cycles.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::error::{Error, Result};
use crate::stack::Stack;

/// Identity stamped by the owner thread's direct recycle path.
///
/// 0 is reserved to mean "in flight"; queue identities start above this.
pub(crate) const OWN_THREAD_ID: u32 = 1;

static ID_GENERATOR: AtomicU32 = AtomicU32::new(OWN_THREAD_ID + 1);

/// Draw a fresh recycle-path identity for a handoff queue.
pub(crate) fn next_recycler_id() -> u32 {
    ID_GENERATOR.fetch_add(1, Ordering::Relaxed)
}

/// Shared recycle-state of one handle.
///
/// `last_recycled_id` is the ownership token during cross-thread
/// handoff: 0 means no recycle path owns the handle, any other value is
/// the identity of the queue or owner path that claimed it. Only the
/// home stack's pop writes it back to zero.
pub(crate) struct HandleState {
    last_recycled_id: AtomicU32,
    recycle_id: AtomicU32,
    been_sampled: AtomicBool,
}

impl HandleState {
    fn new() -> Self {
        Self {
            last_recycled_id: AtomicU32::new(0),
            recycle_id: AtomicU32::new(0),
            been_sampled: AtomicBool::new(false),
        }
    }

    /// Claim the handle for recycle path `id`. Relaxed ordering: only
    /// atomicity matters here, nothing is published through this word
    /// and no caller relies on recycling for correctness.
    #[inline]
    pub(crate) fn claim(&self, id: u32) -> bool {
        self.last_recycled_id
            .compare_exchange(0, id, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn last_recycled_id(&self) -> u32 {
        self.last_recycled_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn recycle_id(&self) -> u32 {
        self.recycle_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_recycle_id(&self, id: u32) {
        self.recycle_id.store(id, Ordering::Relaxed);
    }

    /// Zero both ids: the handle is back in flight. Owner thread only.
    #[inline]
    pub(crate) fn reset_in_flight(&self) {
        self.recycle_id.store(0, Ordering::Relaxed);
        self.last_recycled_id.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn been_sampled(&self) -> bool {
        self.been_sampled.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn mark_sampled(&self) {
        self.been_sampled.store(true, Ordering::Relaxed);
    }
}

/// State shared by every handle of a disabled pool. Never claimed, never
/// stored; recycling such a handle just drops the value.
fn unpooled_state() -> &'static Arc<HandleState> {
    static UNPOOLED: OnceLock<Arc<HandleState>> = OnceLock::new();
    UNPOOLED.get_or_init(|| Arc::new(HandleState::new()))
}

/// One pooled value plus its recycle bookkeeping.
///
/// Moves between exactly one container at a time: the user (wrapped in
/// [`Pooled`]), a stack slot, or a handoff link slot.
pub(crate) struct Handle<T> {
    state: Arc<HandleState>,
    /// Home stack; detached while the handle sits in a handoff link and
    /// re-bound by the consumer after transfer.
    home: Weak<Stack<T>>,
    value: Box<T>,
}

impl<T: Send + 'static> Handle<T> {
    pub(crate) fn new(home: Weak<Stack<T>>, value: T) -> Self {
        Self {
            state: Arc::new(HandleState::new()),
            home,
            value: Box::new(value),
        }
    }

    fn unpooled(value: T) -> Self {
        Self {
            state: unpooled_state().clone(),
            home: Weak::new(),
            value: Box::new(value),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> &HandleState {
        &self.state
    }

    #[inline]
    pub(crate) fn value_ref(&self) -> &T {
        &self.value
    }

    /// Drop the home pointer. Called by the producer right before the
    /// handle is published into a link slot.
    #[inline]
    pub(crate) fn detach_home(&mut self) {
        self.home = Weak::new();
    }

    /// Re-attach the handle to the stack that consumed it.
    #[inline]
    pub(crate) fn rebind_home(&mut self, home: Weak<Stack<T>>) {
        self.home = home;
    }
}

/// A value borrowed from a [`Pool`](crate::Pool).
///
/// Dereferences to the pooled value. Returns to the pool on drop; call
/// [`recycle`](Pooled::recycle) for the explicit, error-reporting path
/// or [`take`](Pooled::take) to remove the value from circulation.
pub struct Pooled<T: Send + 'static> {
    handle: Option<Handle<T>>,
    pool_id: u64,
}

impl<T: Send + 'static> Pooled<T> {
    pub(crate) fn from_handle(handle: Handle<T>, pool_id: u64) -> Self {
        Self {
            handle: Some(handle),
            pool_id,
        }
    }

    /// Wrap a value that will never be pooled (disabled pool, or the
    /// calling thread is tearing down).
    pub(crate) fn unpooled(value: T, pool_id: u64) -> Self {
        Self {
            handle: Some(Handle::unpooled(value)),
            pool_id,
        }
    }

    /// Return the value to its home stack.
    ///
    /// Fails with [`Error::DoubleRecycle`] when called a second time
    /// without an intervening get. A value whose home stack is gone
    /// (owner thread exited, or pooling disabled) is simply dropped.
    pub fn recycle(&mut self) -> Result<()> {
        let handle = self.handle.take().ok_or(Error::DoubleRecycle)?;
        match handle.home.upgrade() {
            Some(stack) => Stack::push(&stack, handle),
            None => Ok(()),
        }
    }

    /// Remove the value from pool circulation, consuming the wrapper.
    pub fn take(mut self) -> T {
        let handle = self.handle.take().expect("value already recycled");
        *handle.value
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// True for handles backed by the shared no-op state.
    pub(crate) fn is_unpooled(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |h| Arc::ptr_eq(&h.state, unpooled_state()))
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.handle.as_ref().expect("value already recycled").value
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.handle.as_mut().expect("value already recycled").value
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.recycle();
        }
    }
}

impl<T: Send + 'static + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("value", &self.handle.as_ref().map(|h| &h.value))
            .finish()
    }
}
