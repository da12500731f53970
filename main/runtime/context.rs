//! Speculative conflict detection.
//!
//! A [`Lockable`] is any object embedding a [`LockSlot`]: an atomic owner
//! word plus an intrusive link. A [`SimpleRuntimeContext`] represents one
//! in-flight `for_each` iteration; it acquires lockables by CASing their
//! owner word from null to itself and threads them onto its acquired list.
//! A failed acquire reports [`LoopError::Conflict`], which the operator
//! propagates with `?` back to the worker loop; the loop then cancels the
//! iteration (releasing everything acquired so far) and retries the item
//! later. Committing an iteration is nothing more than releasing its locks.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Error signals an operator can raise; interpreted by the `for_each`
/// worker loop and never surfaced past the loop call site.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopError {
    /// The iteration raced with another context over a lockable. The loop
    /// aborts and retries the item.
    Conflict,
    /// The operator reached a point after which it cannot be rolled back
    /// and wants to stop early without being considered failed. The loop
    /// commits the iteration.
    ReachedFailsafe,
    /// Stop the whole loop. The loop commits the iteration, raises the
    /// break flag, and every worker drains out.
    Break,
}

/// What an operator intends to do with a locked object. The read/write
/// distinction is advisory; locks are mutually exclusive either way.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MethodFlag {
    /// No conflict detection.
    Unprotected,
    /// The object was acquired earlier in this iteration; no acquire.
    Previous,
    Read,
    Write,
}

impl MethodFlag {
    fn should_lock(self) -> bool {
        match self {
            MethodFlag::Unprotected | MethodFlag::Previous => false,
            MethodFlag::Read | MethodFlag::Write => true,
        }
    }
}

/// The embedded lock state of a [`Lockable`] object: a tagged owner word
/// (a `SimpleRuntimeContext` address, or 0 when free) and the intrusive
/// next link of the owning context's acquired list.
#[derive(Debug, Default)]
pub struct LockSlot {
    owner: AtomicUsize,
    /// Only the owning context follows or mutates this link.
    next: UnsafeCell<*const LockSlot>,
}

// SAFETY: `owner` is atomic; `next` is only touched by the context that
// holds `owner`, which serializes access.
unsafe impl Sync for LockSlot {}
unsafe impl Send for LockSlot {}

impl LockSlot {
    pub fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            next: UnsafeCell::new(std::ptr::null()),
        }
    }

    /// The context currently holding this slot, as an opaque address. For
    /// assertions and tests.
    pub fn owner_addr(&self) -> usize {
        self.owner.load(Ordering::Relaxed)
    }
}

/// An object that can be acquired by speculative iterations. Implementors
/// embed a [`LockSlot`] and hand out a reference to it.
pub trait Lockable {
    fn lock_slot(&self) -> &LockSlot;
}

impl Lockable for LockSlot {
    fn lock_slot(&self) -> &LockSlot {
        self
    }
}

/// One iteration's speculative state: the intrusive list of lock slots it
/// has acquired. A thread installs at most one context at a time.
pub struct SimpleRuntimeContext {
    /// Head of the acquired list, threaded through `LockSlot::next`.
    head: Cell<*const LockSlot>,
}

impl SimpleRuntimeContext {
    pub fn new() -> Self {
        Self {
            head: Cell::new(std::ptr::null()),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Must hold at the start of every iteration: nothing acquired.
    pub fn start_iteration(&self) {
        debug_assert!(self.head.get().is_null());
    }

    /// Try to take ownership of `slot`. Re-acquiring a slot this context
    /// already owns is a no-op.
    pub fn acquire(&self, slot: &LockSlot, flag: MethodFlag) -> Result<(), LoopError> {
        if !flag.should_lock() {
            return Ok(());
        }

        match slot.owner.compare_exchange(
            0,
            self.addr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // new owner; thread onto the acquired list
                // SAFETY: we hold `owner`, so nobody else touches `next`
                unsafe { *slot.next.get() = self.head.get() };
                self.head.set(slot as *const LockSlot);
                Ok(())
            }
            Err(current) if current == self.addr() => Ok(()),
            Err(_) => Err(LoopError::Conflict),
        }
    }

    /// Release everything acquired by this iteration after its operator
    /// returned normally. Returns the number of locks released.
    pub fn commit_iteration(&self) -> usize {
        self.release_all()
    }

    /// Release everything acquired by an aborted iteration. Locks must be
    /// freed on this path just as on commit.
    pub fn cancel_iteration(&self) -> usize {
        self.release_all()
    }

    fn release_all(&self) -> usize {
        let mut released = 0;
        let mut cur = self.head.get();
        self.head.set(std::ptr::null());

        while !cur.is_null() {
            // SAFETY: every slot on the list is owned by us, so its `next`
            // is ours to read and clear
            let slot = unsafe { &*cur };
            assert_eq!(
                slot.owner.load(Ordering::Relaxed),
                self.addr(),
                "releasing a lock owned by another context"
            );
            cur = unsafe { *slot.next.get() };
            unsafe { *slot.next.get() = std::ptr::null() };
            slot.owner.store(0, Ordering::Release);
            released += 1;
        }
        released
    }
}

impl Default for SimpleRuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimpleRuntimeContext {
    fn drop(&mut self) {
        // a context must not die still holding locks
        assert!(
            self.head.get().is_null(),
            "context dropped with locks held; commit or cancel the iteration first"
        );
    }
}

std::thread_local! {
    /// The context of the iteration currently running on this thread, if
    /// any. Set by the executor around each iteration.
    static THREAD_CONTEXT: Cell<*const SimpleRuntimeContext> =
        const { Cell::new(std::ptr::null()) };
}

/// Install (or clear) the calling thread's context. Used by the executors;
/// operators never call this.
pub fn set_thread_context(ctx: Option<&SimpleRuntimeContext>) {
    THREAD_CONTEXT.with(|c| {
        c.set(ctx.map_or(std::ptr::null(), |x| x as *const SimpleRuntimeContext))
    });
}

/// Acquire `lockable` on behalf of the current iteration. Outside of a
/// conflict-detecting loop (no installed context) this is a no-op, so the
/// same operator code runs under both `do_all` and speculative `for_each`.
pub fn acquire<L: Lockable + ?Sized>(lockable: &L, flag: MethodFlag) -> Result<(), LoopError> {
    if !flag.should_lock() {
        return Ok(());
    }
    THREAD_CONTEXT.with(|c| {
        let ptr = c.get();
        if ptr.is_null() {
            return Ok(());
        }
        // SAFETY: the executor keeps the installed context alive for as
        // long as it is installed
        let ctx = unsafe { &*ptr };
        ctx.acquire(lockable.lock_slot(), flag)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let ctx = SimpleRuntimeContext::new();
        let a = LockSlot::new();
        let b = LockSlot::new();

        ctx.start_iteration();
        ctx.acquire(&a, MethodFlag::Write).unwrap();
        ctx.acquire(&b, MethodFlag::Read).unwrap();
        // re-acquire is a no-op
        ctx.acquire(&a, MethodFlag::Write).unwrap();

        assert_eq!(a.owner_addr(), &ctx as *const _ as usize);
        assert_eq!(ctx.commit_iteration(), 2);
        assert_eq!(a.owner_addr(), 0);
        assert_eq!(b.owner_addr(), 0);
    }

    #[test]
    fn test_conflict_between_contexts() {
        let c1 = SimpleRuntimeContext::new();
        let c2 = SimpleRuntimeContext::new();
        let slot = LockSlot::new();

        c1.acquire(&slot, MethodFlag::Write).unwrap();
        assert_eq!(c2.acquire(&slot, MethodFlag::Write), Err(LoopError::Conflict));

        // cancel frees the lock for the other context
        c1.cancel_iteration();
        c2.acquire(&slot, MethodFlag::Write).unwrap();
        c2.commit_iteration();
    }

    #[test]
    fn test_unprotected_never_locks() {
        let ctx = SimpleRuntimeContext::new();
        let slot = LockSlot::new();

        ctx.acquire(&slot, MethodFlag::Unprotected).unwrap();
        ctx.acquire(&slot, MethodFlag::Previous).unwrap();
        assert_eq!(slot.owner_addr(), 0);
        assert_eq!(ctx.commit_iteration(), 0);
    }

    #[test]
    fn test_free_function_without_context() {
        // with no installed context, acquire is a no-op (do_all path)
        let slot = LockSlot::new();
        acquire(&slot, MethodFlag::Write).unwrap();
        assert_eq!(slot.owner_addr(), 0);
    }

    #[test]
    fn test_free_function_with_context() {
        let ctx = SimpleRuntimeContext::new();
        let slot = LockSlot::new();

        set_thread_context(Some(&ctx));
        acquire(&slot, MethodFlag::Write).unwrap();
        set_thread_context(None);

        assert_ne!(slot.owner_addr(), 0);
        assert_eq!(ctx.commit_iteration(), 1);
    }
}
