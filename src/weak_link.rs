//! A breakable weak reference. Buffer handles an application still holds
//! must be able to outlive the queue that produced them; the queue breaks
//! its link at teardown and every surviving handle goes inert instead of
//! dangling.

use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

/// Owning side of the link. Exactly one per protected object; broken once,
/// at teardown, by the owner.
pub struct WeakLink<T> {
    inner: Arc<RwLock<Option<T>>>,
}

/// Borrowing side. Any number may exist, on any thread; after the master
/// is broken every `lock()` returns `None` forever.
pub struct WeakLinkClient<T> {
    inner: Arc<RwLock<Option<T>>>,
}

/// Shared-lock view of the live object. While any guard is held the owner
/// cannot complete a break, so the object cannot go away mid-access.
pub struct WeakLinkGuard<'a, T> {
    guard: RwLockReadGuard<'a, Option<T>>,
}

impl<T> WeakLink<T> {
    pub fn new(value: T) -> Self {
        WeakLink { inner: Arc::new(RwLock::new(Some(value))) }
    }

    pub fn client(&self) -> WeakLinkClient<T> {
        WeakLinkClient { inner: Arc::clone(&self.inner) }
    }

    /// Severs the link: waits for outstanding shared locks, then drops the
    /// protected object. One-way and consuming, so it cannot be called
    /// twice or concurrently from two owners.
    pub fn break_link(self) {
        let mut slot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}

impl<T> WeakLinkClient<T> {
    /// Returns a guard over the live object, or `None` if the link was
    /// broken. Safe to call at any time from any thread.
    pub fn lock(&self) -> Option<WeakLinkGuard<'_, T>> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            Some(WeakLinkGuard { guard })
        } else {
            None
        }
    }
}

impl<T> Clone for WeakLinkClient<T> {
    fn clone(&self) -> Self {
        WeakLinkClient { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Deref for WeakLinkGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Invariant: a guard is only constructed over Some.
        self.guard.as_ref().expect("guard over broken link")
    }
}
