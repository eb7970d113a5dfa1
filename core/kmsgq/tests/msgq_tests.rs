use std::{
    sync::{Arc, Once},
    thread,
    time::Duration,
};

use kerrno::KError;
use kheap::{HeapAlgorithm, system};
use kmsgq::{MSGQ_MAX_MSG_SIZE, MsgQueue};
use ksync::WakePolicy;
use ktask::Timeout;

static INIT: Once = Once::new();

fn init_system_heap() {
    INIT.call_once(|| {
        let arena = Box::leak(vec![0u128; 16 * 1024].into_boxed_slice());
        unsafe {
            system()
                .register_region(arena.as_mut_ptr() as usize, arena.len() * 16, HeapAlgorithm::Buddy)
                .unwrap();
        }
    });
}

fn recv_vec(q: &MsgQueue, timeout: Timeout) -> Result<Vec<u8>, KError> {
    let mut buf = vec![0; q.msg_size()];
    let len = q.recv(&mut buf, timeout)?;
    buf.truncate(len);
    Ok(buf)
}

#[test]
fn messages_keep_order_and_length() {
    init_system_heap();
    let q = MsgQueue::create("order", 16, 4).unwrap();
    assert!(q.is_empty());
    assert_eq!(q.queue_depth(), 4);

    q.send(b"one", Timeout::NoWait).unwrap();
    q.send(b"two!", Timeout::NoWait).unwrap();
    q.send_urgent(b"first", Timeout::NoWait).unwrap();
    assert_eq!(q.used_entry_count(), 3);
    assert_eq!(q.unused_entry_count(), 1);

    assert_eq!(recv_vec(&q, Timeout::NoWait).unwrap(), b"first");
    assert_eq!(recv_vec(&q, Timeout::NoWait).unwrap(), b"one");
    assert_eq!(recv_vec(&q, Timeout::NoWait).unwrap(), b"two!");
    assert_eq!(recv_vec(&q, Timeout::NoWait), Err(KError::WouldBlock));
    assert!(q.is_empty());
    q.destroy().unwrap();
}

#[test]
fn full_queue_refuses_senders() {
    init_system_heap();
    let q = MsgQueue::create("full", 8, 2).unwrap();
    q.send(b"a", Timeout::NoWait).unwrap();
    q.send(b"b", Timeout::NoWait).unwrap();
    assert!(q.is_full());
    assert_eq!(q.send(b"c", Timeout::NoWait), Err(KError::WouldBlock));
    assert_eq!(q.send(b"c", Timeout::from_millis(30)), Err(KError::TimedOut));
    assert_eq!(q.info().senders_waiting, 0);
}

#[test]
fn bad_sizes_are_rejected() {
    init_system_heap();
    assert_eq!(MsgQueue::create("zero", 0, 4).map(|_| ()), Err(KError::InvalidInput));
    assert_eq!(MsgQueue::create("deep", 8, 0).map(|_| ()), Err(KError::InvalidInput));
    assert_eq!(
        MsgQueue::create("wide", MSGQ_MAX_MSG_SIZE + 1, 4).map(|_| ()),
        Err(KError::InvalidInput)
    );

    let q = MsgQueue::create("sizes", 8, 2).unwrap();
    assert_eq!(q.send(&[0; 9], Timeout::NoWait), Err(KError::InvalidInput));
    assert_eq!(q.send(&[], Timeout::NoWait), Err(KError::InvalidInput));
    assert!(q.is_empty());
}

#[test]
fn short_receive_buffer_leaves_message_queued() {
    init_system_heap();
    let q = MsgQueue::create("short", 16, 2).unwrap();
    q.send(b"0123456789", Timeout::NoWait).unwrap();

    let mut small = [0; 4];
    assert_eq!(q.recv(&mut small, Timeout::NoWait), Err(KError::InvalidInput));
    assert_eq!(q.used_entry_count(), 1);
    assert_eq!(recv_vec(&q, Timeout::NoWait).unwrap(), b"0123456789");
}

#[test]
fn blocked_receiver_gets_the_next_message() {
    init_system_heap();
    let q = MsgQueue::create("wake", 8, 2).unwrap();
    let receiver = {
        let q = q.clone();
        thread::spawn(move || recv_vec(&q, Timeout::Forever))
    };
    while q.info().receivers_waiting == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    q.send(b"ping", Timeout::NoWait).unwrap();
    assert_eq!(receiver.join().unwrap().unwrap(), b"ping");
    assert!(q.is_empty());
    assert_eq!(q.unused_entry_count(), 2);
}

#[test]
fn blocked_sender_gets_a_freed_slot() {
    init_system_heap();
    let q = MsgQueue::create("room", 8, 1).unwrap();
    q.send(b"first", Timeout::NoWait).unwrap();
    let sender = {
        let q = q.clone();
        thread::spawn(move || q.send(b"second", Timeout::Forever))
    };
    while q.info().senders_waiting == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(q.set_wake_policy(WakePolicy::Fifo), Err(KError::ResourceBusy));
    assert_eq!(recv_vec(&q, Timeout::NoWait).unwrap(), b"first");
    sender.join().unwrap().unwrap();
    assert_eq!(recv_vec(&q, Timeout::Forever).unwrap(), b"second");
}

#[test]
fn destroy_wakes_both_sides() {
    init_system_heap();
    let empty = MsgQueue::create("no-msgs", 8, 1).unwrap();
    let full = MsgQueue::create("no-room", 8, 1).unwrap();
    full.send(b"x", Timeout::NoWait).unwrap();

    let receiver = {
        let q = empty.clone();
        thread::spawn(move || recv_vec(&q, Timeout::Forever).map(|_| ()))
    };
    let sender = {
        let q = full.clone();
        thread::spawn(move || q.send(b"y", Timeout::Forever))
    };
    while empty.info().receivers_waiting == 0 || full.info().senders_waiting == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    empty.clone().destroy().unwrap();
    full.clone().destroy().unwrap();
    assert_eq!(receiver.join().unwrap(), Err(KError::Destroyed));
    assert_eq!(sender.join().unwrap(), Err(KError::Destroyed));
    assert_eq!(full.send(b"z", Timeout::NoWait), Err(KError::Destroyed));
}

#[test]
fn producers_and_consumers() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 200;
    init_system_heap();
    let q = MsgQueue::create("pipe", 16, 4).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let len = fastrand::usize(1..=16);
                    let msg = vec![(p * PER_PRODUCER + i) as u8; len];
                    q.send(&msg, Timeout::Forever).unwrap();
                }
            })
        })
        .collect();
    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            for _ in 0..PRODUCERS * PER_PRODUCER {
                let msg = recv_vec(&q, Timeout::Forever).unwrap();
                assert!(!msg.is_empty() && msg.len() <= 16);
                assert!(msg.iter().all(|&b| b == msg[0]));
            }
        })
    };
    for p in producers {
        p.join().unwrap();
    }
    consumer.join().unwrap();
    assert!(q.is_empty());
    assert_eq!(q.unused_entry_count(), q.queue_depth());
}
