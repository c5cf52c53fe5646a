//! Operation-context pools: fixed-capacity, lock-guarded free lists.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A context that can be returned to its zero state before reuse.
pub trait Reusable {
    /// Restore every piece of per-operation state. Must leave no open file handles.
    fn reset(&mut self);
}

/// Free list of idle contexts for one operation kind.
///
/// `pop` removes a context from the free list, so the same context can never be
/// handed to two in-flight operations. `push` resets the context and keeps it only
/// while the free list is below capacity. Contexts built by a [`Lease`] fallback
/// never enter the free list; they are dropped when the lease ends.
pub struct ContextPool<C> {
    name: &'static str,
    capacity: usize,
    free: Mutex<Vec<C>>,
    outstanding: AtomicUsize,
}

impl<C: Reusable> ContextPool<C> {
    /// Pool prefilled with `contexts`; capacity is their count.
    pub fn with_contexts(name: &'static str, contexts: Vec<C>) -> Self {
        ContextPool {
            name,
            capacity: contexts.len(),
            free: Mutex::new(contexts),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Take an idle context, or `None` when the pool is empty.
    pub fn pop(&self) -> Option<C> {
        let ctx = self.free.lock().pop();
        if ctx.is_some() {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        }
        ctx
    }

    /// Reset `ctx` and return it to the free list.
    pub fn push(&self, mut ctx: C) {
        ctx.reset();
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(ctx);
        } else {
            tracing::trace!(pool = self.name, "pool full, dropping surplus context");
        }
    }

    /// Check out a context that returns itself to this pool when dropped. When the
    /// pool is empty, `fallback` builds a fresh one that is discarded on drop.
    pub fn lease(self: &Arc<Self>, fallback: impl FnOnce() -> C) -> Lease<C> {
        let (ctx, pooled) = match self.pop() {
            Some(ctx) => (ctx, true),
            None => {
                tracing::debug!(pool = self.name, "pool empty, building fresh context");
                (fallback(), false)
            }
        };
        Lease {
            ctx: Some(ctx),
            pooled,
            pool: Arc::clone(self),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contexts currently in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Pooled contexts currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// A checked-out context. Dropping it pushes the context back to its pool.
pub struct Lease<C: Reusable> {
    ctx: Option<C>,
    /// Popped from the free list, as opposed to built by the fallback.
    pooled: bool,
    pool: Arc<ContextPool<C>>,
}

impl<C: Reusable> Lease<C> {
    /// False for a burst context that will not be returned to the pool.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

impl<C: Reusable> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `Drop` takes the context out.
        self.ctx.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Reusable> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.ctx.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C: Reusable> Drop for Lease<C> {
    fn drop(&mut self) {
        match self.ctx.take() {
            Some(ctx) if self.pooled => self.pool.push(ctx),
            Some(_) => {
                tracing::trace!(pool = self.pool.name, "dropping fallback context");
            }
            None => {}
        }
    }
}
