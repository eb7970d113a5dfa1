// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Critical sections and spinlocks for the kernel core.
//!
//! Every kernel object keeps its mutable state behind a [`SpinNoIrq`]: taking
//! the lock opens a critical section (preemption and local IRQs disabled) and
//! dropping the guard closes it. Critical sections are short and bounded and
//! must never be held across a task suspension.
//!
//! ## Guards
//!
//! - [`NoOp`]: no protection (the caller already runs with IRQs disabled)
//! - [`NoPreempt`]: disables kernel preemption
//! - [`IrqSave`]: saves and disables local IRQs
//! - [`NoPreemptIrqSave`]: both of the above
//!
//! On bare-metal targets the guards call into the kernel through
//! [`KernelGuardIf`]. On hosted targets they only track how deeply the
//! current thread is nested in critical sections, see [`critical_depth`],
//! so that host schedulers can catch a suspension inside a critical section.
//!
//! ## Implementing KernelGuardIf
//!
//! ```rust,ignore
//! use kspin::KernelGuardIf;
//!
//! struct GuardImpl;
//!
//! #[crate_interface::impl_interface]
//! impl KernelGuardIf for GuardImpl {
//!     fn enable_preempt() { /* ... */ }
//!     fn disable_preempt() { /* ... */ }
//!     fn local_irq_save_and_disable() -> usize { 0 }
//!     fn local_irq_restore(flags: usize) { let _ = flags; }
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `smp`: adds an atomic lock word so the lock also excludes other CPUs
//! - `preempt`: let the guards disable preemption through [`KernelGuardIf`]

#![no_std]
#![warn(missing_docs)]

#[cfg(not(target_os = "none"))]
extern crate std;

mod guard;
mod lock;


pub use guard::{BaseGuard, IrqSave, KernelGuardIf, NoOp, NoPreempt, NoPreemptIrqSave};
#[cfg(not(target_os = "none"))]
pub use guard::critical_depth;
pub use lock::{SpinLock, SpinLockGuard};

/// Raw spinlock with no guards.
///
/// **Warning**: Must only be used in contexts where preemption and IRQs
/// are already disabled.
pub type SpinRaw<T> = SpinLock<NoOp, T>;

/// Guard for [`SpinRaw`].
pub type SpinRawGuard<'a, T> = SpinLockGuard<'a, NoOp, T>;

/// Spinlock that disables preemption.
pub type SpinNoPreempt<T> = SpinLock<NoPreempt, T>;

/// Guard for [`SpinNoPreempt`].
pub type SpinNoPreemptGuard<'a, T> = SpinLockGuard<'a, NoPreempt, T>;

/// Spinlock that disables IRQs and preemption.
///
/// Usable from any context, including interrupt handlers. All kernel object
/// state is kept behind this lock.
pub type SpinNoIrq<T> = SpinLock<NoPreemptIrqSave, T>;

/// Guard for [`SpinNoIrq`].
pub type SpinNoIrqGuard<'a, T> = SpinLockGuard<'a, NoPreemptIrqSave, T>;
