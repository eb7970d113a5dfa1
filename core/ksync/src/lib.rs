// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Kernel synchronization primitives.
//!
//! This crate provides blocking synchronization primitives for kernel tasks:
//!
//! - [`RawMutex`] / [`Mutex`]: mutual exclusion with optional recursion and
//!   priority inheritance
//! - [`Semaphore`]: counting semaphore with a bounded count
//! - [`WaitList`]: the ordered list of blocked tasks both are built on, also
//!   used by memory pools and mailboxes
//! - [`spin`]: Re-export of `kspin` for spinlocks
//!
//! Every blocking call takes a [`Timeout`]. Waiters are served according to
//! the object's [`WakePolicy`], and a woken waiter has already been handed
//! the mutex or the signal it waited for.
//!
//! # Examples
//!
//! ## Mutex
//! ```no_run
//! use ksync::Mutex;
//!
//! static DATA: Mutex<Vec<u8>> = Mutex::new(Vec::new());
//!
//! fn task() {
//!     let mut data = DATA.lock();
//!     data.push(42);
//! }
//! ```
//!
//! ## Recursive mutex with a timeout
//! ```no_run
//! use ksync::{RawMutex, Timeout};
//!
//! static BUS: RawMutex = RawMutex::new("i2c0", true);
//!
//! fn transfer() -> kerrno::KResult {
//!     let _bus = BUS.lock(Timeout::from_millis(20))?;
//!     let _again = BUS.lock(Timeout::NoWait)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Semaphore
//! ```no_run
//! use ksync::{Semaphore, Timeout};
//!
//! static SEM: Semaphore = Semaphore::new("slots", 3, 3);
//!
//! fn task() {
//!     let _guard = SEM.wait_guard(Timeout::Forever).unwrap();
//!     // do work with the signal
//!     // it is posted back when the guard is dropped
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;
#[macro_use]
extern crate log;

pub use kspin as spin;
pub use ktask::Timeout;

mod mutex;
mod name;
mod semaphore;
pub mod wait_list;

pub use self::{
    mutex::{Mutex, MutexGuard, MutexInfo, RawMutex, RawMutexGuard},
    name::{KName, NAME_MAX},
    semaphore::{SEM_VALUE_MAX, Semaphore, SemaphoreGuard, SemaphoreInfo},
    wait_list::{WaitList, WakePolicy, Waiter},
};
