// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Mailboxes: bounded queues of machine words.

use alloc::{collections::VecDeque, sync::Arc};
use core::fmt;

use kerrno::{KError, KResult, ensure, k_err};
use ksync::{KName, WaitList, WakePolicy, Waiter, wait_list::wait_for};
use kspin::SpinNoIrq;
use ktask::Timeout;

struct Slots {
    mails: VecDeque<usize>,
    /// Non-empty only while `mails` is full. Each sender carries its mail.
    senders: WaitList,
    /// Non-empty only while `mails` is empty.
    receivers: WaitList,
    destroyed: bool,
}

/// A snapshot of a mailbox, see [`MailBox::info`].
#[derive(Clone, Copy, Debug)]
pub struct MailBoxInfo {
    /// Name given at creation.
    pub name: KName,
    /// Number of mails the mailbox holds when full.
    pub capacity: usize,
    /// Number of mails waiting to be received.
    pub used: usize,
    /// Policy shared by blocked senders and blocked receivers.
    pub policy: WakePolicy,
    /// Senders waiting for room.
    pub senders_waiting: usize,
    /// Receivers waiting for a mail.
    pub receivers_waiting: usize,
}

/// A bounded FIFO of `usize` mails, typically pointers or small handles.
///
/// Mails are never copied through the ring when someone already waits: a
/// send with a receiver blocked hands the mail straight to it, and a receive
/// that frees a slot moves the first blocked sender's mail into the ring
/// before that sender wakes.
pub struct MailBox {
    name: KName,
    capacity: usize,
    slots: SpinNoIrq<Slots>,
}

impl MailBox {
    /// Creates a mailbox for up to `max_mails` mails.
    ///
    /// # Errors
    ///
    /// - [`KError::InvalidInput`] if `max_mails` is zero.
    /// - [`KError::NoMemory`] if the ring cannot be allocated.
    pub fn create(name: &str, max_mails: usize) -> KResult<Arc<Self>> {
        ensure!(max_mails > 0, k_err!(InvalidInput, "empty mailbox"));
        let mut mails = VecDeque::new();
        mails
            .try_reserve_exact(max_mails)
            .map_err(|_| KError::NoMemory)?;
        let mb = Arc::new(Self {
            name: KName::new(name),
            capacity: max_mails,
            slots: SpinNoIrq::new(Slots {
                mails,
                senders: WaitList::new(WakePolicy::Priority),
                receivers: WaitList::new(WakePolicy::Priority),
                destroyed: false,
            }),
        });
        debug!("mailbox {} created for {} mails", mb.name, max_mails);
        Ok(mb)
    }

    /// The name given at creation.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Posts `mail`, waiting up to `timeout` for room.
    ///
    /// # Errors
    ///
    /// - [`KError::WouldBlock`] if the mailbox is full and `timeout` is
    ///   [`Timeout::NoWait`].
    /// - [`KError::TimedOut`] if no room was made in time. The mail was not
    ///   delivered.
    /// - [`KError::Destroyed`] if the mailbox is or gets torn down.
    pub fn send(&self, mail: usize, timeout: Timeout) -> KResult {
        let mut slots = self.slots.lock();
        if slots.destroyed {
            return Err(KError::Destroyed);
        }
        if let Some(receiver) = slots.receivers.pop() {
            receiver.grant(mail);
            return Ok(());
        }
        if slots.mails.len() < self.capacity {
            slots.mails.push_back(mail);
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KError::WouldBlock);
        }

        let waiter = Waiter::current_with(mail);
        slots.senders.push(waiter.clone())?;
        trace!("task {} waits for room in mailbox {}", waiter.task().as_u64(), self.name);
        drop(slots);

        wait_for(&self.slots, &waiter, timeout.deadline(), |slots, waiter| {
            slots.senders.remove(waiter);
        })
        .map(|_| ())
    }

    /// Takes the oldest mail, waiting up to `timeout` for one.
    ///
    /// # Errors
    ///
    /// - [`KError::WouldBlock`] if the mailbox is empty and `timeout` is
    ///   [`Timeout::NoWait`].
    /// - [`KError::TimedOut`] if no mail arrived in time.
    /// - [`KError::Destroyed`] if the mailbox is or gets torn down.
    pub fn recv(&self, timeout: Timeout) -> KResult<usize> {
        let mut slots = self.slots.lock();
        if slots.destroyed {
            return Err(KError::Destroyed);
        }
        if let Some(mail) = slots.mails.pop_front() {
            if let Some(sender) = slots.senders.pop() {
                slots.mails.push_back(sender.payload());
                sender.grant(0);
            }
            return Ok(mail);
        }
        if timeout.is_no_wait() {
            return Err(KError::WouldBlock);
        }

        let waiter = Waiter::current();
        slots.receivers.push(waiter.clone())?;
        drop(slots);

        wait_for(&self.slots, &waiter, timeout.deadline(), |slots, waiter| {
            slots.receivers.remove(waiter);
        })
    }

    /// Number of mails the mailbox holds when full.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of mails waiting to be received.
    pub fn used_entry_count(&self) -> usize {
        self.slots.lock().mails.len()
    }

    /// Number of mails that can be sent without waiting.
    pub fn unused_entry_count(&self) -> usize {
        self.capacity - self.used_entry_count()
    }

    /// Whether no mail is waiting.
    pub fn is_empty(&self) -> bool {
        self.used_entry_count() == 0
    }

    /// Whether a sender would have to wait for room.
    pub fn is_full(&self) -> bool {
        self.used_entry_count() == self.capacity
    }

    /// Sets the policy for both blocked senders and blocked receivers.
    ///
    /// # Errors
    ///
    /// - [`KError::ResourceBusy`] if any task is waiting on the mailbox.
    /// - [`KError::Destroyed`] if the mailbox has been torn down.
    pub fn set_wake_policy(&self, policy: WakePolicy) -> KResult {
        let mut slots = self.slots.lock();
        if slots.destroyed {
            return Err(KError::Destroyed);
        }
        ensure!(
            slots.senders.is_empty() && slots.receivers.is_empty(),
            k_err!(ResourceBusy, self.name)
        );
        slots.senders.set_policy(policy)?;
        slots.receivers.set_policy(policy)
    }

    /// Takes a snapshot of the mailbox.
    pub fn info(&self) -> MailBoxInfo {
        let slots = self.slots.lock();
        MailBoxInfo {
            name: self.name,
            capacity: self.capacity,
            used: slots.mails.len(),
            policy: slots.receivers.policy(),
            senders_waiting: slots.senders.len(),
            receivers_waiting: slots.receivers.len(),
        }
    }

    /// Tears the mailbox down. Blocked senders and receivers wake with
    /// [`KError::Destroyed`] and undelivered mails are dropped.
    pub fn destroy(self: Arc<Self>) -> KResult {
        let mut slots = self.slots.lock();
        if slots.destroyed {
            return Err(KError::Destroyed);
        }
        slots.destroyed = true;
        let dropped = slots.mails.len();
        slots.mails.clear();
        let woken = slots.senders.cancel_all() + slots.receivers.cancel_all();
        debug!(
            "mailbox {} destroyed, {} mails dropped, {} waiters woken",
            self.name, dropped, woken
        );
        Ok(())
    }
}

impl fmt::Debug for MailBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailBox")
            .field("name", &self.name)
            .field("used", &self.used_entry_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
