use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use kerrno::KError;
use ksync::{Semaphore, Timeout, WakePolicy};
use ktask::{Priority, host::set_current_priority};

fn wait_for_waiters(sem: &Semaphore, count: usize) {
    while sem.info().waiters < count {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn semaphore_basic() {
    let sem = Semaphore::new("basic", 3, 3);

    assert_eq!(sem.count(), 3);

    let _g1 = sem.wait_guard(Timeout::Forever).unwrap();
    assert_eq!(sem.count(), 2);

    let _g2 = sem.wait_guard(Timeout::Forever).unwrap();
    assert_eq!(sem.count(), 1);

    let _g3 = sem.wait_guard(Timeout::Forever).unwrap();
    assert_eq!(sem.count(), 0);

    // All signals taken
    assert_eq!(sem.try_wait(), Err(KError::WouldBlock));

    drop(_g1);
    assert_eq!(sem.count(), 1);

    // One signal posted back
    assert!(sem.try_wait().is_ok());
}

#[test]
fn semaphore_wait_post() {
    let sem = Semaphore::new("pair", 2, 2);

    sem.wait(Timeout::Forever).unwrap();
    assert_eq!(sem.count(), 1);

    sem.wait(Timeout::Forever).unwrap();
    assert_eq!(sem.count(), 0);

    sem.post().unwrap();
    assert_eq!(sem.count(), 1);

    sem.post().unwrap();
    assert_eq!(sem.count(), 2);
}

#[test]
fn semaphore_concurrent() {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static MAX_COUNTER: AtomicU32 = AtomicU32::new(0);
    let sem = Arc::new(Semaphore::new("conc", 3, 3));
    let mut handles = vec![];

    for _ in 0..10 {
        let sem = sem.clone();
        let handle = thread::spawn(move || {
            let _g = sem.wait_guard(Timeout::Forever).unwrap();

            let count = COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
            MAX_COUNTER.fetch_max(count, Ordering::SeqCst);

            // Verify at most 3 concurrent accesses
            assert!(count <= 3, "too many concurrent accesses: {}", count);

            thread::yield_now();

            COUNTER.fetch_sub(1, Ordering::SeqCst);
        });
        handles.push(handle);
    }

    for h in handles {
        h.join().unwrap();
    }

    assert!(MAX_COUNTER.load(Ordering::SeqCst) <= 3);
    assert_eq!(COUNTER.load(Ordering::SeqCst), 0);
    assert_eq!(sem.count(), 3);
}

#[test]
fn blocked_waiter_gets_the_post() {
    let sem = Arc::new(Semaphore::new("one", 0, 1));
    let sem2 = sem.clone();
    let t1 = thread::spawn(move || sem2.wait(Timeout::Forever));
    wait_for_waiters(&sem, 1);

    sem.post().unwrap();
    assert_eq!(t1.join().unwrap(), Ok(()));
    // the signal went to the waiter, not to the count
    assert_eq!(sem.count(), 0);
}

#[test]
fn post_on_full_semaphore_overflows() {
    let sem = Semaphore::new("full", 2, 2);
    assert_eq!(sem.post(), Err(KError::Overflow));
    assert_eq!(sem.count(), 2);
    assert_eq!(sem.max_count(), 2);
}

#[test]
fn wait_times_out() {
    let sem = Arc::new(Semaphore::new("late", 0, 1));
    let sem2 = sem.clone();
    let res = thread::spawn(move || sem2.wait(Timeout::from_millis(30)))
        .join()
        .unwrap();
    assert_eq!(res, Err(KError::TimedOut));
    assert_eq!(sem.info().waiters, 0);

    // nobody waits any more, so the post is counted
    sem.post().unwrap();
    assert_eq!(sem.count(), 1);
}

fn signal_order(policy: WakePolicy) -> Vec<Priority> {
    let sem = Arc::new(Semaphore::new("order", 0, 8));
    sem.set_wake_policy(policy).unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for prio in [8, 1, 4] {
        let (sem2, order) = (sem.clone(), order.clone());
        waiters.push(thread::spawn(move || {
            set_current_priority(prio);
            sem2.wait(Timeout::Forever).unwrap();
            order.lock().unwrap().push(prio);
        }));
        wait_for_waiters(&sem, waiters.len());
    }

    for n in 1..=3 {
        sem.post().unwrap();
        // each post releases exactly one waiter
        while order.lock().unwrap().len() < n {
            thread::sleep(Duration::from_millis(1));
        }
    }
    for w in waiters {
        w.join().unwrap();
    }
    Arc::try_unwrap(order).unwrap().into_inner().unwrap()
}

#[test]
fn signals_follow_wake_policy() {
    assert_eq!(signal_order(WakePolicy::Priority), [1, 4, 8]);
    assert_eq!(signal_order(WakePolicy::Fifo), [8, 1, 4]);
}

#[test]
fn wake_policy_is_fixed_while_waited_on() {
    let sem = Arc::new(Semaphore::new("busy", 0, 1));
    let sem2 = sem.clone();
    let waiter = thread::spawn(move || sem2.wait(Timeout::Forever));
    wait_for_waiters(&sem, 1);
    assert_eq!(
        sem.set_wake_policy(WakePolicy::Fifo),
        Err(KError::ResourceBusy)
    );
    sem.post().unwrap();
    waiter.join().unwrap().unwrap();
    assert_eq!(sem.set_wake_policy(WakePolicy::Fifo), Ok(()));
}

#[test]
fn destroy_wakes_every_waiter() {
    let sem = Semaphore::create("doomed", 0, 4).unwrap();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let sem = sem.clone();
            thread::spawn(move || sem.wait(Timeout::Forever))
        })
        .collect();
    wait_for_waiters(&sem, 3);

    sem.clone().destroy().unwrap();
    for w in waiters {
        assert_eq!(w.join().unwrap(), Err(KError::Destroyed));
    }
    assert_eq!(sem.post(), Err(KError::Destroyed));
}
