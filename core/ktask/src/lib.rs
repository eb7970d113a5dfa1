// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The scheduler interface consumed by the kernel synchronization core.
//!
//! Mutexes, semaphores and memory pools never pick the next task to run.
//! They only need to know who is calling, to suspend and resume tasks, and
//! to lend priority to a task for priority inheritance. The scheduler
//! provides exactly that by implementing [`SchedIf`]:
//!
//! ```rust,ignore
//! #[crate_interface::impl_interface]
//! impl ktask::SchedIf for KernelSched {
//!     fn current_task() -> TaskId { /* ... */ }
//!     // ...
//! }
//! ```
//!
//! # Cargo Features
//!
//! - `host`: implement [`SchedIf`] on top of std threads (see [`host`]). This
//!   is what the tests of every crate in the core run on.

#![cfg_attr(not(any(test, feature = "host")), no_std)]

#[macro_use]
extern crate log;

#[cfg(feature = "host")]
pub mod host;

use core::num::NonZeroU64;

/// Number of task priority levels.
pub const PRIORITY_LEVELS: usize = kconfig::PRIORITY_LEVELS;

/// Scheduler ticks per second.
pub const TICKS_PER_SECOND: u64 = kconfig::TICKS_PER_SECOND as u64;

/// Priority of a task. Smaller values are more urgent; 0 is the most urgent.
pub type Priority = u8;

/// The least urgent priority.
pub const LOWEST_PRIORITY: Priority = (PRIORITY_LEVELS - 1) as Priority;

/// Returns whether `prio` is within the configured priority levels.
pub const fn is_valid_priority(prio: Priority) -> bool {
    (prio as usize) < PRIORITY_LEVELS
}

/// Opaque identifier of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    /// Wraps a raw task id. Zero is not a valid id.
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Returns the raw id.
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

/// How long a blocking call may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Do not wait at all.
    NoWait,
    /// Wait for at most this many ticks. `Ticks(0)` is the same as `NoWait`.
    Ticks(u64),
    /// Wait until served.
    Forever,
}

impl Timeout {
    /// Builds a timeout from a tick count.
    pub const fn from_ticks(ticks: u64) -> Self {
        if ticks == 0 {
            Self::NoWait
        } else {
            Self::Ticks(ticks)
        }
    }

    /// Builds a timeout from milliseconds, rounding up to whole ticks.
    ///
    /// Durations too long to count in ticks saturate to the longest finite
    /// wait.
    pub const fn from_millis(ms: u64) -> Self {
        Self::from_ticks(ms.saturating_mul(TICKS_PER_SECOND).div_ceil(1000))
    }

    /// Whether the caller must not be suspended.
    pub const fn is_no_wait(self) -> bool {
        matches!(self, Self::NoWait | Self::Ticks(0))
    }

    /// The absolute tick at which a wait starting now gives up, or `None`
    /// for [`Timeout::Forever`].
    pub fn deadline(self) -> Option<u64> {
        match self {
            Self::NoWait => Some(now_ticks()),
            Self::Ticks(t) => Some(now_ticks().saturating_add(t)),
            Self::Forever => None,
        }
    }
}

/// The services the synchronization core needs from the scheduler.
#[crate_interface::def_interface]
pub trait SchedIf {
    /// Returns the id of the running task.
    fn current_task() -> TaskId;

    /// Returns the effective priority of `task`: the most urgent of its own
    /// priority and every priority currently lent to it.
    fn task_priority(task: TaskId) -> Priority;

    /// Lends `prio` to `task` on behalf of `lender`, replacing whatever
    /// `lender` lent to `task` before.
    ///
    /// `lender` identifies the object the loan is for, e.g. one mutex held by
    /// `task`. Loans from different lenders stack: the task runs at the most
    /// urgent of them until each is withdrawn.
    fn raise_priority(task: TaskId, lender: usize, prio: Priority);

    /// Withdraws the loan `lender` made to `task`. The task keeps running at
    /// the most urgent of its own priority and the remaining loans.
    fn restore_priority(task: TaskId, lender: usize);

    /// Suspends the running task until it is resumed or until the absolute
    /// tick `deadline` passes.
    ///
    /// A [`resume`](SchedIf::resume) that arrives before the suspension must
    /// not be lost: the next suspension then returns immediately. Spurious
    /// returns are allowed.
    fn suspend_current(deadline: Option<u64>);

    /// Makes `task` runnable again.
    fn resume(task: TaskId);

    /// Returns the number of ticks since boot.
    fn now_ticks() -> u64;
}

/// Returns the id of the running task.
#[inline]
pub fn current() -> TaskId {
    crate_interface::call_interface!(SchedIf::current_task)
}

/// Returns the effective priority of `task`.
#[inline]
pub fn priority_of(task: TaskId) -> Priority {
    crate_interface::call_interface!(SchedIf::task_priority, task)
}

/// Lends `prio` to `task` on behalf of `lender`.
#[inline]
pub fn raise_priority(task: TaskId, lender: usize, prio: Priority) {
    trace!("lend priority {} to task {} ({:#x})", prio, task.as_u64(), lender);
    crate_interface::call_interface!(SchedIf::raise_priority, task, lender, prio)
}

/// Withdraws the priority `lender` lent to `task`.
#[inline]
pub fn restore_priority(task: TaskId, lender: usize) {
    trace!("withdraw loan {:#x} from task {}", lender, task.as_u64());
    crate_interface::call_interface!(SchedIf::restore_priority, task, lender)
}

/// Suspends the running task until resumed or until `deadline`.
#[inline]
pub fn suspend(deadline: Option<u64>) {
    crate_interface::call_interface!(SchedIf::suspend_current, deadline)
}

/// Makes `task` runnable again.
#[inline]
pub fn resume(task: TaskId) {
    crate_interface::call_interface!(SchedIf::resume, task)
}

/// Returns the number of ticks since boot.
#[inline]
pub fn now_ticks() -> u64 {
    crate_interface::call_interface!(SchedIf::now_ticks)
}
