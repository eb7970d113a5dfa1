// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! A counting semaphore implementation.

use alloc::sync::Arc;
use core::fmt;

use kerrno::{KError, KResult, ensure, k_err};
use kspin::SpinNoIrq;
use ktask::Timeout;

use crate::{
    name::KName,
    wait_list::{WaitList, WakePolicy, Waiter, wait_for},
};

/// Largest `max_count` a semaphore accepts.
pub const SEM_VALUE_MAX: u32 = kconfig::SEM_VALUE_MAX as u32;

struct SemState {
    count: u32,
    waiters: WaitList,
    destroyed: bool,
}

/// A snapshot of a semaphore, see [`Semaphore::info`].
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreInfo {
    /// Name given at creation.
    pub name: KName,
    /// Signals available to take without waiting.
    pub count: u32,
    /// Largest value the count may reach.
    pub max_count: u32,
    /// Policy choosing which waiter a post wakes.
    pub policy: WakePolicy,
    /// Number of tasks waiting for a signal.
    pub waiters: usize,
}

/// A counting semaphore.
///
/// The count never exceeds `max_count`. A [`post`](Semaphore::post) with
/// tasks waiting hands the signal to one of them and leaves the count
/// untouched; a post that would push the count past `max_count` is refused
/// with [`KError::Overflow`].
pub struct Semaphore {
    name: KName,
    max_count: u32,
    state: SpinNoIrq<SemState>,
}

const fn valid_counts(initial: u32, max_count: u32) -> bool {
    max_count > 0 && initial <= max_count && max_count <= SEM_VALUE_MAX
}

impl Semaphore {
    /// Creates a semaphore holding `initial` signals.
    ///
    /// # Panics
    ///
    /// If `max_count` is zero or over [`SEM_VALUE_MAX`], or if `initial`
    /// exceeds `max_count`. Use [`init`](Self::init) to get an error instead.
    pub const fn new(name: &str, initial: u32, max_count: u32) -> Self {
        assert!(valid_counts(initial, max_count), "invalid semaphore counts");
        Self {
            name: KName::new(name),
            max_count,
            state: SpinNoIrq::new(SemState {
                count: initial,
                waiters: WaitList::new(WakePolicy::Priority),
                destroyed: false,
            }),
        }
    }

    /// Creates a semaphore, checking the counts.
    pub fn init(name: &str, initial: u32, max_count: u32) -> KResult<Self> {
        ensure!(
            valid_counts(initial, max_count),
            k_err!(InvalidInput, "invalid semaphore counts")
        );
        Ok(Self::new(name, initial, max_count))
    }

    /// Creates a semaphore on the heap.
    pub fn create(name: &str, initial: u32, max_count: u32) -> KResult<Arc<Self>> {
        let sem = Arc::new(Self::init(name, initial, max_count)?);
        debug!("semaphore {} created, {}/{}", sem.name, initial, max_count);
        Ok(sem)
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Takes one signal, waiting up to `timeout` for one to be posted.
    ///
    /// # Errors
    ///
    /// - [`KError::WouldBlock`] if no signal is available and `timeout` is
    ///   [`Timeout::NoWait`].
    /// - [`KError::TimedOut`] if no signal arrived in time.
    /// - [`KError::Destroyed`] if the semaphore is or gets torn down.
    pub fn wait(&self, timeout: Timeout) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        if state.count > 0 {
            state.count -= 1;
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KError::WouldBlock);
        }

        let waiter = Waiter::current();
        state.waiters.push(waiter.clone())?;
        drop(state);

        wait_for(&self.state, &waiter, timeout.deadline(), |state, waiter| {
            state.waiters.remove(waiter);
        })
        .map(|_| ())
    }

    /// Takes one signal if one is available.
    pub fn try_wait(&self) -> KResult {
        self.wait(Timeout::NoWait)
    }

    /// Takes one signal and returns a guard that posts it back when dropped.
    pub fn wait_guard(&self, timeout: Timeout) -> KResult<SemaphoreGuard<'_>> {
        self.wait(timeout)?;
        Ok(SemaphoreGuard { sem: self })
    }

    /// Posts one signal.
    ///
    /// # Errors
    ///
    /// - [`KError::Overflow`] if nobody waits and the count is already at
    ///   `max_count`. The count is left unchanged.
    /// - [`KError::Destroyed`] if the semaphore has been torn down.
    pub fn post(&self) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        if let Some(waiter) = state.waiters.pop() {
            trace!("semaphore {} signals task {}", self.name, waiter.task().as_u64());
            waiter.grant(0);
            return Ok(());
        }
        if state.count == self.max_count {
            return k_err!(Overflow, self.name);
        }
        state.count += 1;
        Ok(())
    }

    /// Number of signals available.
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Most signals the semaphore holds.
    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// The policy choosing which waiter gets the next signal.
    pub fn wake_policy(&self) -> WakePolicy {
        self.state.lock().waiters.policy()
    }

    /// Changes the wake policy. Only allowed while nobody waits.
    pub fn set_wake_policy(&self, policy: WakePolicy) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        state.waiters.set_policy(policy)
    }

    /// Takes a snapshot of the semaphore.
    pub fn info(&self) -> SemaphoreInfo {
        let state = self.state.lock();
        SemaphoreInfo {
            name: self.name,
            count: state.count,
            max_count: self.max_count,
            policy: state.waiters.policy(),
            waiters: state.waiters.len(),
        }
    }

    /// Tears the semaphore down, waking every waiter with
    /// [`KError::Destroyed`].
    pub fn deinit(&self) -> KResult {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(KError::Destroyed);
        }
        state.destroyed = true;
        state.count = 0;
        let woken = state.waiters.cancel_all();
        debug!("semaphore {} torn down, {} waiters woken", self.name, woken);
        Ok(())
    }

    /// Tears down a semaphore made by [`create`](Self::create).
    pub fn destroy(self: Arc<Self>) -> KResult {
        self.deinit()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("count", &self.count())
            .field("max_count", &self.max_count)
            .finish()
    }
}

/// RAII guard for a semaphore signal.
///
/// The signal is posted back when the guard is dropped.
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sem.post() {
            debug!("semaphore {} guard not posted: {:?}", self.sem.name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_validated() {
        assert_eq!(Semaphore::init("s", 0, 0).err(), Some(KError::InvalidInput));
        assert_eq!(Semaphore::init("s", 3, 2).err(), Some(KError::InvalidInput));
        assert!(Semaphore::init("s", 2, 2).is_ok());
        assert!(Semaphore::create("s", 0, SEM_VALUE_MAX).is_ok());
    }

    #[test]
    #[should_panic(expected = "invalid semaphore counts")]
    fn const_new_rejects_bad_counts() {
        let _ = Semaphore::new("s", 1, 0);
    }

    #[test]
    fn overflow_keeps_the_count() {
        let sem = Semaphore::new("full", 1, 1);
        assert_eq!(sem.post(), Err(KError::Overflow));
        assert_eq!(sem.count(), 1);
        sem.try_wait().unwrap();
        assert_eq!(sem.try_wait(), Err(KError::WouldBlock));
        sem.post().unwrap();
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn guard_posts_back() {
        let sem = Semaphore::new("guard", 2, 2);
        {
            let _a = sem.wait_guard(Timeout::Forever).unwrap();
            let _b = sem.wait_guard(Timeout::NoWait).unwrap();
            assert_eq!(sem.count(), 0);
            assert!(sem.wait_guard(Timeout::NoWait).is_err());
        }
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn torn_down_semaphore_refuses_everything() {
        let sem = Semaphore::create("gone", 1, 4).unwrap();
        sem.clone().destroy().unwrap();
        assert_eq!(sem.wait(Timeout::NoWait), Err(KError::Destroyed));
        assert_eq!(sem.post(), Err(KError::Destroyed));
        assert_eq!(sem.set_wake_policy(WakePolicy::Fifo), Err(KError::Destroyed));
        assert_eq!(sem.count(), 0);
    }
}
