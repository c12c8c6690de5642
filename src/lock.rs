//! Cooperative per-resource locking.
//!
//! Two independent mechanisms live here:
//!
//! - [`ResourceLocks`], the caller-facing cooperative lock: an explicit
//!   acquire/release keyed by resource id, meant to serialize multi-step
//!   flows spanning several engine calls (a multi-request booking wizard,
//!   say). It is advisory and orthogonal to transactional isolation, not a
//!   substitute for it.
//! - [`Serializer`], the engine-internal wrapper that gives every mutating
//!   scheduler entry point a per-resource critical section, so the reads a
//!   decision is based on and the writes it produces are never interleaved
//!   with another writer in this process.
//!
//! Both are sharded concurrent maps keyed by resource id rather than one
//! global mutex, so unrelated resources never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Advisory lock registry keyed by resource id.
///
/// `try_acquire` either takes the lock and returns true, or returns false if
/// someone else holds it. Nothing blocks and nothing expires; callers are
/// expected to release what they acquired.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    held: DashMap<Uuid, ()>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static ResourceLocks {
        static GLOBAL: std::sync::OnceLock<ResourceLocks> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(ResourceLocks::new)
    }

    /// Try to take the lock for a resource. Returns false if already held.
    pub fn try_acquire(&self, resource: Uuid) -> bool {
        let mut acquired = false;
        self.held.entry(resource).or_insert_with(|| {
            acquired = true;
        });
        acquired
    }

    /// Release the lock for a resource. Releasing an unheld lock is a no-op.
    pub fn release(&self, resource: Uuid) {
        self.held.remove(&resource);
    }

    /// True if the resource is currently locked.
    pub fn is_locked(&self, resource: Uuid) -> bool {
        self.held.contains_key(&resource)
    }
}

/// Per-resource mutex map serializing mutating scheduler operations.
#[derive(Debug, Default)]
pub(crate) struct Serializer {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Serializer {
    /// The process-wide serializer shared by all scheduler instances.
    pub(crate) fn global() -> &'static Serializer {
        static GLOBAL: std::sync::OnceLock<Serializer> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(Serializer::default)
    }

    /// Enter the critical section of a resource. The guard is held for the
    /// duration of one scheduler operation.
    pub(crate) async fn serialized(&self, resource: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(resource)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_exclusive_until_released() {
        let locks = ResourceLocks::new();
        let resource = Uuid::new_v4();

        assert!(locks.try_acquire(resource));
        assert!(!locks.try_acquire(resource));
        assert!(locks.is_locked(resource));

        locks.release(resource);
        assert!(!locks.is_locked(resource));
        assert!(locks.try_acquire(resource));
    }

    #[test]
    fn unrelated_resources_do_not_contend() {
        let locks = ResourceLocks::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(locks.try_acquire(a));
        assert!(locks.try_acquire(b));
    }

    #[tokio::test]
    async fn serializer_orders_critical_sections() {
        let serializer = Serializer::default();
        let resource = Uuid::new_v4();

        let guard = serializer.serialized(resource).await;

        // a second entry must wait until the guard drops
        let second = serializer.serialized(resource);
        tokio::pin!(second);
        assert!(futures_pending(&mut second).await);

        drop(guard);
        second.await;
    }

    /// Polls the future once and reports whether it was still pending.
    async fn futures_pending<F: std::future::Future + Unpin>(f: &mut F) -> bool {
        use std::task::Poll;
        let mut f = Some(f);
        std::future::poll_fn(move |cx| {
            let pending = matches!(std::pin::Pin::new(f.take().unwrap()).poll(cx), Poll::Pending);
            Poll::Ready(pending)
        })
        .await
    }
}
