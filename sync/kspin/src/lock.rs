// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Spinlock parameterized by the guard that opens its critical section.

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use crate::guard::BaseGuard;

/// The lock word. Without `smp` there is nobody to exclude once the guard
/// has opened the critical section, so the word is elided.
struct LockWord {
    #[cfg(feature = "smp")]
    held: core::sync::atomic::AtomicBool,
}

impl LockWord {
    const fn new() -> Self {
        Self {
            #[cfg(feature = "smp")]
            held: core::sync::atomic::AtomicBool::new(false),
        }
    }

    #[inline(always)]
    fn try_take(&self) -> bool {
        #[cfg(feature = "smp")]
        {
            use core::sync::atomic::Ordering;
            self.held
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }
        #[cfg(not(feature = "smp"))]
        {
            true
        }
    }

    #[inline(always)]
    fn take(&self) {
        #[cfg(feature = "smp")]
        {
            use core::sync::atomic::Ordering;
            while self
                .held
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.is_held() {
                    core::hint::spin_loop();
                }
            }
        }
    }

    #[inline(always)]
    fn give(&self) {
        #[cfg(feature = "smp")]
        self.held.store(false, core::sync::atomic::Ordering::Release);
    }

    #[inline(always)]
    fn is_held(&self) -> bool {
        #[cfg(feature = "smp")]
        {
            self.held.load(core::sync::atomic::Ordering::Relaxed)
        }
        #[cfg(not(feature = "smp"))]
        {
            false
        }
    }
}

/// A spinlock whose critical section is opened by the guard `G`.
///
/// # Examples
///
/// ```rust,ignore
/// use kspin::SpinNoIrq;
///
/// let lock = SpinNoIrq::new(42);
/// {
///     let guard = lock.lock();
///     assert_eq!(*guard, 42);
/// } // critical section closed here
/// ```
pub struct SpinLock<G: BaseGuard, T: ?Sized> {
    _guard: PhantomData<G>,
    word: LockWord,
    data: UnsafeCell<T>,
}

/// RAII guard of a [`SpinLock`].
///
/// Dropping it releases the lock and then closes the critical section.
pub struct SpinLockGuard<'a, G: BaseGuard, T: ?Sized + 'a> {
    lock: &'a SpinLock<G, T>,
    state: G::State,
    // Stays on the CPU (and thread) that opened the critical section.
    _pinned: PhantomData<*mut T>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<G: BaseGuard, T: ?Sized + Send> Sync for SpinLock<G, T> {}
unsafe impl<G: BaseGuard, T: ?Sized + Send> Send for SpinLock<G, T> {}

impl<G: BaseGuard, T> SpinLock<G, T> {
    /// Creates a new unlocked spinlock.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        Self {
            _guard: PhantomData,
            word: LockWord::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock and returns the inner value.
    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<G: BaseGuard, T: ?Sized> SpinLock<G, T> {
    /// Opens the critical section and spins until the lock is taken.
    ///
    /// Re-locking from the same context deadlocks on `smp`.
    #[inline(always)]
    pub fn lock(&self) -> SpinLockGuard<'_, G, T> {
        let state = G::acquire();
        self.word.take();
        SpinLockGuard {
            lock: self,
            state,
            _pinned: PhantomData,
        }
    }

    /// Tries to take the lock once.
    ///
    /// On failure the critical section is closed again before returning.
    #[inline(always)]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, G, T>> {
        let state = G::acquire();
        if self.word.try_take() {
            Some(SpinLockGuard {
                lock: self,
                state,
                _pinned: PhantomData,
            })
        } else {
            G::release(state);
            None
        }
    }

    /// Whether the lock is held right now. Only a hint.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.word.is_held()
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock and must have leaked its guard.
    #[inline(always)]
    pub unsafe fn force_unlock(&self) {
        self.word.give();
    }

    /// Returns a mutable reference to the data; no locking is needed since
    /// the borrow is exclusive.
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<G: BaseGuard, T: Default> Default for SpinLock<G, T> {
    #[inline(always)]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<G: BaseGuard, T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<G, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut d = f.debug_struct("SpinLock");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<G: BaseGuard, T: ?Sized> Deref for SpinLockGuard<'_, G, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<G: BaseGuard, T: ?Sized> DerefMut for SpinLockGuard<'_, G, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<G: BaseGuard, T: ?Sized + fmt::Debug> fmt::Debug for SpinLockGuard<'_, G, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<G: BaseGuard, T: ?Sized> Drop for SpinLockGuard<'_, G, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.word.give();
        G::release(self.state);
    }
}
