// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Lists of tasks blocked on one kernel object.
//!
//! A blocked task is represented by a [`Waiter`]. The object that owns the
//! list serves waiters under its own critical section: it pops a waiter and
//! either [grants](Waiter::grant) it the resource (a mutex, a semaphore
//! signal, a pool block) or [cancels](Waiter::cancel) it when the object is
//! torn down. The blocked task then finds the outcome in its waiter when it
//! runs again, so nothing can be stolen between the wakeup and the moment
//! the task resumes.

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use kerrno::{KError, KResult};
use kspin::SpinNoIrq;
use ktask::{Priority, TaskId};

/// Which waiter is released first when an object becomes available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WakePolicy {
    /// The most urgent waiter; FIFO among equal priorities.
    #[default]
    Priority,
    /// The earliest waiter.
    Fifo,
}

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELLED: u8 = 2;

/// A task blocked on a kernel object.
#[derive(Debug)]
pub struct Waiter {
    task: TaskId,
    priority: Priority,
    /// Handed from the blocked task to whoever serves it.
    payload: usize,
    state: AtomicU8,
    token: AtomicUsize,
}

impl Waiter {
    /// Creates a waiter for the running task.
    pub fn current() -> Arc<Self> {
        Self::current_with(0)
    }

    /// Creates a waiter for the running task that carries `payload`, e.g.
    /// the mail a sender blocks with.
    pub fn current_with(payload: usize) -> Arc<Self> {
        let task = ktask::current();
        Arc::new(Self {
            task,
            priority: ktask::priority_of(task),
            payload,
            state: AtomicU8::new(WAITING),
            token: AtomicUsize::new(0),
        })
    }

    /// The value the waiter was created with.
    pub fn payload(&self) -> usize {
        self.payload
    }

    /// The blocked task.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Priority of the task when it blocked.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Serves the waiter, handing it `token`, and resumes its task.
    ///
    /// Must be called under the owning object's lock, after the waiter has
    /// been removed from the list.
    pub fn grant(&self, token: usize) {
        self.token.store(token, Ordering::Relaxed);
        self.state.store(GRANTED, Ordering::Release);
        trace!("grant task {} token {:#x}", self.task.as_u64(), token);
        ktask::resume(self.task);
    }

    /// Wakes the waiter with [`KError::Destroyed`].
    pub fn cancel(&self) {
        self.state.store(CANCELLED, Ordering::Release);
        ktask::resume(self.task);
    }

    /// The outcome, once the waiter has been served or cancelled.
    pub fn outcome(&self) -> Option<KResult<usize>> {
        match self.state.load(Ordering::Acquire) {
            WAITING => None,
            GRANTED => Some(Ok(self.token.load(Ordering::Relaxed))),
            _ => Some(Err(KError::Destroyed)),
        }
    }
}

/// An ordered list of [`Waiter`]s.
pub struct WaitList {
    policy: WakePolicy,
    queue: VecDeque<Arc<Waiter>>,
}

impl WaitList {
    /// Creates an empty list.
    pub const fn new(policy: WakePolicy) -> Self {
        Self {
            policy,
            queue: VecDeque::new(),
        }
    }

    /// The wake policy.
    pub fn policy(&self) -> WakePolicy {
        self.policy
    }

    /// Changes the wake policy. Only allowed while the list is empty, so the
    /// order of queued waiters never has to be rebuilt.
    pub fn set_policy(&mut self, policy: WakePolicy) -> KResult {
        if !self.queue.is_empty() {
            return Err(KError::ResourceBusy);
        }
        self.policy = policy;
        Ok(())
    }

    /// Number of queued waiters.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queues `waiter` according to the wake policy.
    pub fn push(&mut self, waiter: Arc<Waiter>) -> KResult {
        debug_assert!(
            !self.queue.iter().any(|w| w.task == waiter.task),
            "task queued twice on one wait list"
        );
        self.queue
            .try_reserve(1)
            .map_err(|_| KError::NoMemory)?;
        match self.policy {
            WakePolicy::Fifo => self.queue.push_back(waiter),
            WakePolicy::Priority => {
                // behind every waiter at least as urgent
                let at = self
                    .queue
                    .iter()
                    .position(|w| w.priority > waiter.priority)
                    .unwrap_or(self.queue.len());
                self.queue.insert(at, waiter);
            }
        }
        Ok(())
    }

    /// Removes the waiter that must be served next.
    pub fn pop(&mut self) -> Option<Arc<Waiter>> {
        self.queue.pop_front()
    }

    /// Removes `waiter` wherever it is. Returns whether it was queued.
    pub fn remove(&mut self, waiter: &Waiter) -> bool {
        match self.queue.iter().position(|w| core::ptr::eq(&**w, waiter)) {
            Some(at) => {
                self.queue.remove(at);
                true
            }
            None => false,
        }
    }

    /// The most urgent priority among queued waiters, whatever the policy.
    pub fn top_priority(&self) -> Option<Priority> {
        self.queue.iter().map(|w| w.priority).min()
    }

    /// Cancels every waiter. Returns how many were woken.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.queue.len();
        for waiter in self.queue.drain(..) {
            waiter.cancel();
        }
        count
    }
}

/// Suspends the running task until `waiter` is served or cancelled, or until
/// `deadline` passes.
///
/// `waiter` must already be queued on a list kept in `lock`, and `lock` must
/// not be held by the caller. On timeout `on_timeout` runs under `lock` and
/// must take the waiter off its list; [`KError::TimedOut`] is returned.
pub fn wait_for<S>(
    lock: &SpinNoIrq<S>,
    waiter: &Waiter,
    deadline: Option<u64>,
    on_timeout: impl FnOnce(&mut S, &Waiter),
) -> KResult<usize> {
    trace!("task {} blocks", waiter.task.as_u64());
    loop {
        if let Some(outcome) = waiter.outcome() {
            return outcome;
        }
        if let Some(deadline) = deadline {
            if ktask::now_ticks() >= deadline {
                let mut state = lock.lock();
                // served between the check and taking the lock
                if let Some(outcome) = waiter.outcome() {
                    return outcome;
                }
                on_timeout(&mut state, waiter);
                trace!("task {} timed out", waiter.task.as_u64());
                return Err(KError::TimedOut);
            }
        }
        ktask::suspend(deadline);
    }
}
