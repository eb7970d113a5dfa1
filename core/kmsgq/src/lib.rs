// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Bounded message queues and mailboxes.
//!
//! A [`MailBox`] passes single machine words, such as pointers to buffers
//! the sender fills, and needs no message storage beyond its ring.
//!
//! A [`MsgQueue`] copies messages of up to `msg_size` bytes into blocks of a
//! private [`MemPool`]. The pool bounds the queue: a sender blocks in the
//! pool until a receiver gives a block back. A [`Semaphore`] counts queued
//! messages and blocks receivers while the queue is empty.
//!
//! ```no_run
//! use kmsgq::MsgQueue;
//! use ktask::Timeout;
//!
//! let q = MsgQueue::create("events", 32, 8).unwrap();
//! q.send(b"hello", Timeout::NoWait).unwrap();
//!
//! let mut buf = [0; 32];
//! let len = q.recv(&mut buf, Timeout::Forever).unwrap();
//! assert_eq!(&buf[..len], b"hello");
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;
#[macro_use]
extern crate log;

use alloc::{collections::VecDeque, sync::Arc};
use core::{fmt, ptr};

use kerrno::{KError, KResult, ensure, k_err};
use kheap::Heap;
use ksync::{KName, Semaphore, WakePolicy};
use kspin::SpinNoIrq;
use ktask::Timeout;
use mempool::MemPool;

mod mailbox;

pub use self::mailbox::{MailBox, MailBoxInfo};

/// Largest `msg_size` a queue accepts.
pub const MSGQ_MAX_MSG_SIZE: usize = kconfig::MSGQ_MAX_MSG_SIZE;

#[derive(Clone, Copy)]
struct Message {
    block: usize,
    len: usize,
}

struct Queue {
    msgs: VecDeque<Message>,
    destroyed: bool,
}

/// A snapshot of a queue, see [`MsgQueue::info`].
#[derive(Clone, Copy, Debug)]
pub struct MsgQueueInfo {
    /// Name given at creation.
    pub name: KName,
    /// Largest message the queue carries, in bytes.
    pub msg_size: usize,
    /// Number of messages the queue holds when full.
    pub depth: usize,
    /// Number of queued messages.
    pub used: usize,
    /// Number of free message slots.
    pub unused: usize,
    /// Policy shared by blocked senders and blocked receivers.
    pub policy: WakePolicy,
    /// Senders waiting for a free slot.
    pub senders_waiting: usize,
    /// Receivers waiting for a message.
    pub receivers_waiting: usize,
}

/// A bounded queue of byte messages.
pub struct MsgQueue {
    name: KName,
    msg_size: usize,
    pool: Arc<MemPool>,
    ready: Semaphore,
    queue: SpinNoIrq<Queue>,
}

impl MsgQueue {
    /// Creates a queue for `max_msgs` messages of up to `msg_size` bytes,
    /// with storage from `heap`.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if either size is zero, `msg_size` exceeds
    ///   [`MSGQ_MAX_MSG_SIZE`] or `max_msgs` exceeds
    ///   [`SEM_VALUE_MAX`](ksync::SEM_VALUE_MAX).
    /// - [`KError::NoMemory`] if the heap cannot hold the messages.
    pub fn create_in(
        heap: &'static Heap,
        name: &str,
        msg_size: usize,
        max_msgs: usize,
    ) -> KResult<Arc<Self>> {
        ensure!(
            msg_size > 0 && msg_size <= MSGQ_MAX_MSG_SIZE,
            k_err!(InvalidInput, "bad message size")
        );
        let Ok(depth) = u32::try_from(max_msgs) else {
            return k_err!(InvalidInput, "queue too deep");
        };
        let ready = Semaphore::init(name, 0, depth)?;
        let pool = MemPool::create_in(heap, name, max_msgs, msg_size)?;
        let queue = Arc::new(Self {
            name: KName::new(name),
            msg_size,
            pool,
            ready,
            queue: SpinNoIrq::new(Queue {
                msgs: VecDeque::new(),
                destroyed: false,
            }),
        });
        debug!("msgq {} created: {} x {}", queue.name, max_msgs, msg_size);
        Ok(queue)
    }

    /// Creates a queue on the [system heap](kheap::system).
    pub fn create(name: &str, msg_size: usize, max_msgs: usize) -> KResult<Arc<Self>> {
        Self::create_in(kheap::system(), name, msg_size, max_msgs)
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Largest message the queue carries, in bytes.
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    fn post(&self, msg: &[u8], timeout: Timeout, urgent: bool) -> KResult {
        ensure!(
            !msg.is_empty() && msg.len() <= self.msg_size,
            k_err!(InvalidInput, "bad message length")
        );
        let block = self.pool.alloc(timeout).map_err(|err| {
            if err == KError::NoMemory {
                KError::WouldBlock
            } else {
                err
            }
        })?;
        unsafe { ptr::copy_nonoverlapping(msg.as_ptr(), block.as_ptr(), msg.len()) };

        let entry = Message {
            block: block.as_ptr() as usize,
            len: msg.len(),
        };
        let mut queue = self.queue.lock();
        if queue.destroyed {
            return Err(KError::Destroyed);
        }
        queue.msgs.try_reserve(1).map_err(|_| KError::NoMemory)?;
        if urgent {
            queue.msgs.push_front(entry);
        } else {
            queue.msgs.push_back(entry);
        }
        drop(queue);
        self.ready.post()
    }

    /// Appends a message, waiting up to `timeout` for room.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if `msg` is empty or longer than
    ///   [`msg_size`](Self::msg_size).
    /// - [`KError::WouldBlock`] if the queue is full and `timeout` is
    ///   [`Timeout::NoWait`].
    /// - [`KError::TimedOut`] if no room was made in time.
    /// - [`KError::Destroyed`] if the queue is or gets torn down.
    pub fn send(&self, msg: &[u8], timeout: Timeout) -> KResult {
        self.post(msg, timeout, false)
    }

    /// Like [`send`](Self::send), but puts the message at the head of the
    /// queue.
    pub fn send_urgent(&self, msg: &[u8], timeout: Timeout) -> KResult {
        self.post(msg, timeout, true)
    }

    /// Takes the message at the head of the queue into `buf`, waiting up to
    /// `timeout` for one. Returns its length.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if `buf` is shorter than the message. The
    ///   message stays queued.
    /// - [`KError::WouldBlock`] if the queue is empty and `timeout` is
    ///   [`Timeout::NoWait`].
    /// - [`KError::TimedOut`] if no message arrived in time.
    /// - [`KError::Destroyed`] if the queue is or gets torn down.
    pub fn recv(&self, buf: &mut [u8], timeout: Timeout) -> KResult<usize> {
        self.ready.wait(timeout)?;

        let mut queue = self.queue.lock();
        if queue.destroyed {
            return Err(KError::Destroyed);
        }
        let Some(&msg) = queue.msgs.front() else {
            return k_err!(Corruption, "message count out of step");
        };
        if msg.len > buf.len() {
            drop(queue);
            self.ready.post()?;
            return k_err!(InvalidInput, "receive buffer too small");
        }
        queue.msgs.pop_front();
        drop(queue);

        unsafe { ptr::copy_nonoverlapping(msg.block as *const u8, buf.as_mut_ptr(), msg.len) };
        let block = ptr::NonNull::new(msg.block as *mut u8).ok_or(KError::Corruption)?;
        self.pool.free(block)?;
        Ok(msg.len)
    }

    /// Number of messages the queue holds when full.
    pub fn queue_depth(&self) -> usize {
        self.pool.total_blocks()
    }

    /// Number of queued messages.
    pub fn used_entry_count(&self) -> usize {
        self.queue.lock().msgs.len()
    }

    /// Number of message slots a sender could take right now.
    pub fn unused_entry_count(&self) -> usize {
        self.pool.free_blocks()
    }

    /// Whether no message is queued.
    pub fn is_empty(&self) -> bool {
        self.used_entry_count() == 0
    }

    /// Whether a sender would have to wait for room.
    pub fn is_full(&self) -> bool {
        self.unused_entry_count() == 0
    }

    /// Sets the policy for both blocked senders and blocked receivers.
    ///
    /// # Errors
    ///
    /// [`KError::ResourceBusy`] if any task is waiting on the queue.
    pub fn set_wake_policy(&self, policy: WakePolicy) -> KResult {
        ensure!(
            self.pool.info().waiters == 0 && self.ready.info().waiters == 0,
            k_err!(ResourceBusy, self.name)
        );
        self.ready.set_wake_policy(policy)?;
        self.pool.set_wake_policy(policy)
    }

    /// Takes a snapshot of the queue.
    pub fn info(&self) -> MsgQueueInfo {
        let pool = self.pool.info();
        let ready = self.ready.info();
        MsgQueueInfo {
            name: self.name,
            msg_size: self.msg_size,
            depth: pool.total_blocks,
            used: self.used_entry_count(),
            unused: pool.free_blocks,
            policy: ready.policy,
            senders_waiting: pool.waiters,
            receivers_waiting: ready.waiters,
        }
    }

    /// Tears the queue down. Blocked senders and receivers wake with
    /// [`KError::Destroyed`] and queued messages are dropped.
    pub fn destroy(self: Arc<Self>) -> KResult {
        let mut queue = self.queue.lock();
        if queue.destroyed {
            return Err(KError::Destroyed);
        }
        queue.destroyed = true;
        let dropped = queue.msgs.len();
        queue.msgs.clear();
        drop(queue);

        self.ready.deinit()?;
        self.pool.deinit()?;
        debug!("msgq {} destroyed, {} messages dropped", self.name, dropped);
        Ok(())
    }
}

impl fmt::Debug for MsgQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQueue")
            .field("name", &self.name)
            .field("msg_size", &self.msg_size)
            .field("used", &self.used_entry_count())
            .field("depth", &self.queue_depth())
            .finish()
    }
}
