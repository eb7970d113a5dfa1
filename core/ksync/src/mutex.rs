// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! A blocking mutex with optional recursion and priority inheritance.

use alloc::sync::Arc;
use core::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

use kerrno::{KError, KResult, k_err};
use kspin::SpinNoIrq;
use ktask::{Priority, TaskId, Timeout};

use crate::{
    name::KName,
    wait_list::{WaitList, WakePolicy, Waiter, wait_for},
};

struct MutexState {
    owner: Option<TaskId>,
    lock_count: usize,
    /// Priority this mutex lends to the owner, while any task waits for it.
    lent: Option<Priority>,
    waiters: WaitList,
    destroyed: bool,
}

impl MutexState {
    /// Lends the owner the priority of the most urgent waiter, or withdraws
    /// the loan once nobody waits.
    fn update_loan(&mut self, lender: usize) {
        let Some(owner) = self.owner else {
            return;
        };
        let top = self.waiters.top_priority();
        if top == self.lent {
            return;
        }
        match top {
            Some(prio) => ktask::raise_priority(owner, lender, prio),
            None => ktask::restore_priority(owner, lender),
        }
        self.lent = top;
    }

    /// Withdraws the loan from the owner before it loses the mutex.
    fn end_loan(&mut self, lender: usize) {
        if let (Some(owner), Some(_)) = (self.owner, self.lent.take()) {
            ktask::restore_priority(owner, lender);
        }
    }
}

/// Hands out the ids mutexes lend priority under.
static NEXT_LENDER: AtomicUsize = AtomicUsize::new(1);

/// A snapshot of a mutex, see [`RawMutex::info`].
#[derive(Clone, Copy, Debug)]
pub struct MutexInfo {
    /// Name given at creation.
    pub name: KName,
    /// Task owning the mutex.
    pub owner: Option<TaskId>,
    /// How many times the owner has locked the mutex.
    pub lock_count: usize,
    /// Whether the owner may lock the mutex again.
    pub recursive: bool,
    /// Priority this mutex lends to its owner on behalf of the waiters.
    pub lent_priority: Option<Priority>,
    /// Effective priority of the owner, counting what other mutexes lend it.
    pub owner_priority: Option<Priority>,
    /// Policy choosing the next owner.
    pub policy: WakePolicy,
    /// Number of tasks waiting for the mutex.
    pub waiters: usize,
}

/// A mutex owned by at most one task at a time.
///
/// A task that finds the mutex owned is suspended on the mutex's wait list
/// and lends its priority to the owner until it is served. The owner keeps
/// every loan of every mutex it holds, and gives back only this mutex's loan
/// when it releases this mutex. Loans are not passed on when the owner itself
/// waits for another mutex. Unlocking hands
/// the mutex straight to the next waiter, so a task woken by an unlock
/// already owns the mutex when it runs.
///
/// Static mutexes are built with [`RawMutex::new`] and torn down with
/// [`RawMutex::deinit`]; heap ones come from [`RawMutex::create`] and go
/// away with [`RawMutex::destroy`].
pub struct RawMutex {
    name: KName,
    recursive: bool,
    /// Id of the priority loans of this mutex, 0 until first needed.
    lender: AtomicUsize,
    state: SpinNoIrq<MutexState>,
}

impl RawMutex {
    /// Creates an unlocked mutex.
    pub const fn new(name: &str, recursive: bool) -> Self {
        Self {
            name: KName::new(name),
            recursive,
            lender: AtomicUsize::new(0),
            state: SpinNoIrq::new(MutexState {
                owner: None,
                lock_count: 0,
                lent: None,
                waiters: WaitList::new(WakePolicy::Priority),
                destroyed: false,
            }),
        }
    }

    /// Creates an unlocked mutex on the heap.
    pub fn create(name: &str, recursive: bool) -> Arc<Self> {
        let mutex = Arc::new(Self::new(name, recursive));
        debug!("mutex {} created, recursive: {}", mutex.name, recursive);
        mutex
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Whether the owner may lock the mutex again.
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    fn lender(&self) -> usize {
        let id = self.lender.load(Ordering::Relaxed);
        if id != 0 {
            return id;
        }
        let fresh = NEXT_LENDER.fetch_add(1, Ordering::Relaxed);
        match self
            .lender
            .compare_exchange(0, fresh, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => fresh,
            Err(id) => id,
        }
    }

    /// Locks the mutex for the running task, waiting up to `timeout`.
    ///
    /// The mutex stays locked until [`unlock`](Self::unlock) has been called
    /// as many times as `acquire` succeeded.
    ///
    /// # Errors
    ///
    /// - [`KError::NotReentrant`] if the caller owns a non-recursive mutex.
    /// - [`KError::WouldBlock`] if another task owns it and `timeout` is
    ///   [`Timeout::NoWait`].
    /// - [`KError::TimedOut`] if it was not handed over in time.
    /// - [`KError::Destroyed`] if the mutex is or gets torn down.
    pub fn acquire(&self, timeout: Timeout) -> KResult {
        let me = ktask::current();
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        let owner = match state.owner {
            None => {
                state.owner = Some(me);
                state.lock_count = 1;
                return Ok(());
            }
            Some(owner) if owner == me => {
                if !self.recursive {
                    return k_err!(NotReentrant, self.name);
                }
                state.lock_count = state.lock_count.checked_add(1).ok_or(KError::Overflow)?;
                return Ok(());
            }
            Some(owner) => owner,
        };
        if timeout.is_no_wait() {
            return Err(KError::WouldBlock);
        }

        let lender = self.lender();
        let waiter = Waiter::current();
        state.waiters.push(waiter.clone())?;
        state.update_loan(lender);
        trace!(
            "task {} waits for mutex {} owned by {}",
            me.as_u64(),
            self.name,
            owner.as_u64()
        );
        drop(state);

        wait_for(&self.state, &waiter, timeout.deadline(), |state, waiter| {
            state.waiters.remove(waiter);
            state.update_loan(lender);
        })
        .map(|_| ())
    }

    /// Locks the mutex and returns a guard that unlocks it when dropped.
    pub fn lock(&self, timeout: Timeout) -> KResult<RawMutexGuard<'_>> {
        self.acquire(timeout)?;
        Ok(RawMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Locks the mutex only if that needs no waiting.
    pub fn try_lock(&self) -> KResult<RawMutexGuard<'_>> {
        self.lock(Timeout::NoWait)
    }

    /// Undoes one successful [`acquire`](Self::acquire).
    ///
    /// When the last level is released the owner gives back the priority
    /// this mutex lent it, keeping what other held mutexes lend, and the
    /// mutex passes to the next waiter, if any.
    ///
    /// # Errors
    ///
    /// - [`KError::NotOwner`] if the running task does not own the mutex.
    /// - [`KError::Destroyed`] if the mutex has been torn down.
    pub fn unlock(&self) -> KResult {
        let me = ktask::current();
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        if state.owner != Some(me) {
            return k_err!(NotOwner, self.name);
        }
        state.lock_count -= 1;
        if state.lock_count > 0 {
            return Ok(());
        }

        let lender = self.lender();
        state.end_loan(lender);
        match state.waiters.pop() {
            Some(next) => {
                state.owner = Some(next.task());
                state.lock_count = 1;
                state.update_loan(lender);
                trace!("mutex {} handed to task {}", self.name, next.task().as_u64());
                next.grant(0);
            }
            None => state.owner = None,
        }
        Ok(())
    }

    /// The task owning the mutex.
    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }

    /// How many times the owner has locked the mutex.
    pub fn lock_count(&self) -> usize {
        self.state.lock().lock_count
    }

    /// Whether some task owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// The policy choosing which waiter gets the mutex next.
    pub fn wake_policy(&self) -> WakePolicy {
        self.state.lock().waiters.policy()
    }

    /// Changes the wake policy. Only allowed while the mutex is free.
    pub fn set_wake_policy(&self, policy: WakePolicy) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        if state.owner.is_some() {
            return k_err!(ResourceBusy, "wake policy change on a locked mutex");
        }
        state.waiters.set_policy(policy)
    }

    /// Takes a snapshot of the mutex.
    pub fn info(&self) -> MutexInfo {
        let state = self.state.lock();
        MutexInfo {
            name: self.name,
            owner: state.owner,
            lock_count: state.lock_count,
            recursive: self.recursive,
            lent_priority: state.lent,
            owner_priority: state.owner.map(ktask::priority_of),
            policy: state.waiters.policy(),
            waiters: state.waiters.len(),
        }
    }

    /// Tears the mutex down.
    ///
    /// An owner loses the mutex and any inherited priority, and every waiter
    /// wakes with [`KError::Destroyed`]. Every later operation fails with
    /// [`KError::Destroyed`].
    pub fn deinit(&self) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        state.destroyed = true;
        let lender = self.lender();
        state.end_loan(lender);
        if let Some(owner) = state.owner.take() {
            warn!(
                "mutex {} torn down while owned by task {}",
                self.name,
                owner.as_u64()
            );
        }
        state.lock_count = 0;
        let woken = state.waiters.cancel_all();
        debug!("mutex {} torn down, {} waiters woken", self.name, woken);
        Ok(())
    }

    /// Tears down a mutex made by [`create`](Self::create).
    pub fn destroy(self: Arc<Self>) -> KResult {
        self.deinit()
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.destroyed && state.owner.is_some() {
            warn!("mutex {} dropped while locked", self.name);
        }
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RawMutex")
            .field("name", &self.name)
            .field("owner", &state.owner)
            .field("lock_count", &state.lock_count)
            .field("recursive", &self.recursive)
            .finish()
    }
}

/// Releases one level of a [`RawMutex`] when dropped.
#[must_use = "if unused the mutex will immediately unlock"]
pub struct RawMutexGuard<'a> {
    mutex: &'a RawMutex,
    // the unlock must run on the owning task
    _not_send: PhantomData<*const ()>,
}

impl RawMutexGuard<'_> {
    /// The locked mutex.
    pub fn mutex(&self) -> &RawMutex {
        self.mutex
    }
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock() {
            debug!("guard of mutex {} not released: {:?}", self.mutex.name, err);
        }
    }
}

unsafe impl lock_api::RawMutex for RawMutex {
    type GuardMarker = lock_api::GuardNoSend;

    /// Initial value for an unlocked mutex.
    ///
    /// A “non-constant” const item is a legacy way to supply an initialized
    /// value to downstream static items. Can hopefully be replaced with
    /// `const fn new() -> Self` at some point.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawMutex::new("mutex", false);

    fn lock(&self) {
        if let Err(err) = self.acquire(Timeout::Forever) {
            panic!("task failed to lock mutex {}: {:?}", self.name, err);
        }
    }

    fn try_lock(&self) -> bool {
        self.acquire(Timeout::NoWait).is_ok()
    }

    unsafe fn unlock(&self) {
        if let Err(err) = RawMutex::unlock(self) {
            panic!("task failed to unlock mutex {}: {:?}", self.name, err);
        }
    }

    fn is_locked(&self) -> bool {
        RawMutex::is_locked(self)
    }
}

/// An alias of [`lock_api::Mutex`].
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
/// An alias of [`lock_api::MutexGuard`].
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
