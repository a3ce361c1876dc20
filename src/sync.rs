//! Critical sections shared between task and interrupt context.

use core::cell::UnsafeCell;

use portable_atomic::{AtomicBool, Ordering};

/// A non-reentrant spinlock.
///
/// Task-context users additionally wrap acquisition in a
/// `critical_section` so an interrupt on the same core cannot preempt the
/// holder and spin forever; interrupt-context users already run with
/// interrupts masked and only need the atomic itself.
pub(crate) struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// # Safety
    ///
    /// Must only be called by the current holder of the lock.
    unsafe fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Data protected by a [`RawSpinlock`], with separate acquisition flavors
/// for task and interrupt context.
///
/// Both flavors end up in the same atomic, so every call site carries a
/// greppable marker for which context it runs in and it is impossible to
/// take the "wrong" lock.
pub(crate) struct Locked<T> {
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

impl<T> Locked<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: RawSpinlock::new(),
            data: UnsafeCell::new(data),
        }
    }

    fn locked<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        struct Guard<'a>(&'a RawSpinlock);

        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                unsafe { self.0.release() };
            }
        }

        self.lock.acquire();
        let _guard = Guard(&self.lock);
        f(unsafe { &mut *self.data.get() })
    }

    /// Exclusive access from task context.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|_| self.locked(f))
    }

    /// Exclusive access from interrupt context. Interrupts are already
    /// masked at the current level; do not re-enter the critical section.
    pub fn with_from_isr<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.locked(f)
    }
}

unsafe impl<T: Send> Sync for Locked<T> {}
