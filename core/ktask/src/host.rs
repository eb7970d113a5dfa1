// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! A [`SchedIf`] implementation on top of std threads.
//!
//! Every thread becomes a task the first time it asks for its id. Suspension
//! is `thread::park`, so a resume that races ahead of the suspension is kept
//! as the thread's unpark token. Priorities are only bookkept: the OS still
//! decides which thread runs, but tests can observe inheritance through
//! [`priority_of`](crate::priority_of). A task's own priority and the loans
//! it holds are kept apart, so withdrawing one loan never undoes another.
//!
//! Suspending while a `kspin` critical section is open panics.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

use crate::{Priority, SchedIf, TICKS_PER_SECOND, TaskId};

/// Priority of a thread that never set one.
pub const DEFAULT_PRIORITY: Priority = (crate::PRIORITY_LEVELS / 2) as Priority;

struct Registry {
    threads: BTreeMap<TaskId, Thread>,
    priorities: BTreeMap<TaskId, Priority>,
    /// Priorities lent to a task, keyed by borrower and lender.
    loans: BTreeMap<(TaskId, usize), Priority>,
}

impl Registry {
    fn effective_priority(&self, task: TaskId) -> Priority {
        let own = self.priorities.get(&task).copied().unwrap_or(DEFAULT_PRIORITY);
        self.loans
            .range((task, 0)..=(task, usize::MAX))
            .map(|(_, &prio)| prio)
            .fold(own, Priority::min)
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    threads: BTreeMap::new(),
    priorities: BTreeMap::new(),
    loans: BTreeMap::new(),
});

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HostTask {
    id: TaskId,
}

impl HostTask {
    fn register() -> Self {
        let raw = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let id = TaskId::new(raw).unwrap_or_else(|| unreachable!());
        registry().threads.insert(id, thread::current());
        debug!("host task {} is {:?}", raw, thread::current().name());
        Self { id }
    }
}

impl Drop for HostTask {
    fn drop(&mut self) {
        let mut reg = registry();
        reg.threads.remove(&self.id);
        reg.priorities.remove(&self.id);
        let id = self.id;
        reg.loans.retain(|&(task, _), _| task != id);
    }
}

std::thread_local! {
    static CURRENT: HostTask = HostTask::register();
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(1_000_000_000) / TICKS_PER_SECOND)
}

/// Sets the priority of the calling thread. Loans it holds still apply on
/// top.
pub fn set_current_priority(prio: Priority) {
    assert!(crate::is_valid_priority(prio), "invalid priority {prio}");
    let id = crate::current();
    registry().priorities.insert(id, prio);
}

/// Sleeps the calling thread for `ticks` scheduler ticks.
pub fn sleep_ticks(ticks: u64) {
    thread::sleep(ticks_to_duration(ticks));
}

struct HostSched;

#[crate_interface::impl_interface]
impl SchedIf for HostSched {
    fn current_task() -> TaskId {
        CURRENT.with(|task| task.id)
    }

    fn task_priority(task: TaskId) -> Priority {
        registry().effective_priority(task)
    }

    fn raise_priority(task: TaskId, lender: usize, prio: Priority) {
        registry().loans.insert((task, lender), prio);
    }

    fn restore_priority(task: TaskId, lender: usize) {
        registry().loans.remove(&(task, lender));
    }

    fn suspend_current(deadline: Option<u64>) {
        assert_eq!(
            kspin::critical_depth(),
            0,
            "task suspended inside a critical section"
        );
        match deadline {
            None => thread::park(),
            Some(deadline) => {
                let now = crate::now_ticks();
                if deadline > now {
                    thread::park_timeout(ticks_to_duration(deadline - now));
                }
            }
        }
    }

    fn resume(task: TaskId) {
        let thread = registry().threads.get(&task).cloned();
        match thread {
            Some(thread) => thread.unpark(),
            None => warn!("resume of unknown host task {}", task.as_u64()),
        }
    }

    fn now_ticks() -> u64 {
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
        (elapsed.as_nanos() * TICKS_PER_SECOND as u128 / 1_000_000_000) as u64
    }
}
