// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Guards that open and close critical sections.

/// Low-level kernel hooks used by the guards on bare-metal targets.
#[crate_interface::def_interface]
pub trait KernelGuardIf {
    /// Enable kernel preemption.
    fn enable_preempt();

    /// Disable kernel preemption.
    fn disable_preempt();

    /// Save and disable local interrupts, returning saved flags.
    fn local_irq_save_and_disable() -> usize;

    /// Restore local interrupts from saved flags.
    fn local_irq_restore(flags: usize);
}

/// A way of entering and leaving a critical section.
pub trait BaseGuard {
    /// State saved when entering the critical section.
    type State: Clone + Copy;

    /// Enter the critical section, returning the saved state.
    fn acquire() -> Self::State;

    /// Leave the critical section, restoring `state`.
    fn release(state: Self::State);
}

/// No-op guard, for callers that already run with IRQs disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

impl BaseGuard for NoOp {
    type State = ();

    #[inline(always)]
    fn acquire() -> Self::State {}

    #[inline(always)]
    fn release(_state: Self::State) {}
}

#[cfg(target_os = "none")]
mod kernel {
    use super::BaseGuard;

    /// Guard that saves and disables local IRQs.
    #[derive(Debug, Clone, Copy)]
    pub struct IrqSave;

    /// Guard that disables preemption.
    #[derive(Debug, Clone, Copy)]
    pub struct NoPreempt;

    /// Guard that disables both preemption and local IRQs.
    #[derive(Debug, Clone, Copy)]
    pub struct NoPreemptIrqSave;

    #[inline]
    fn preempt_off() {
        #[cfg(feature = "preempt")]
        crate_interface::call_interface!(crate::guard::KernelGuardIf::disable_preempt);
    }

    #[inline]
    fn preempt_on() {
        #[cfg(feature = "preempt")]
        crate_interface::call_interface!(crate::guard::KernelGuardIf::enable_preempt);
    }

    impl BaseGuard for IrqSave {
        type State = usize;

        #[inline]
        fn acquire() -> usize {
            crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_save_and_disable)
        }

        #[inline]
        fn release(flags: usize) {
            crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_restore, flags)
        }
    }

    impl BaseGuard for NoPreempt {
        type State = ();

        #[inline]
        fn acquire() {
            preempt_off();
        }

        #[inline]
        fn release(_state: ()) {
            preempt_on();
        }
    }

    impl BaseGuard for NoPreemptIrqSave {
        type State = usize;

        #[inline]
        fn acquire() -> usize {
            // preemption first, then IRQs
            preempt_off();
            <IrqSave as BaseGuard>::acquire()
        }

        #[inline]
        fn release(flags: usize) {
            <IrqSave as BaseGuard>::release(flags);
            preempt_on();
        }
    }
}

#[cfg(not(target_os = "none"))]
mod host {
    use core::cell::Cell;

    use super::BaseGuard;

    std::thread_local! {
        static DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    /// Returns how many critical sections the current thread is nested in.
    pub fn critical_depth() -> usize {
        DEPTH.with(Cell::get)
    }

    /// Host stand-in for the kernel guards: it only counts nesting depth.
    #[derive(Debug, Clone, Copy)]
    pub struct HostGuard;

    impl BaseGuard for HostGuard {
        type State = ();

        #[inline]
        fn acquire() {
            DEPTH.with(|d| d.set(d.get() + 1));
        }

        #[inline]
        fn release(_state: ()) {
            DEPTH.with(|d| {
                let depth = d.get();
                assert!(depth > 0, "critical section released twice");
                d.set(depth - 1);
            });
        }
    }
}

#[cfg(not(target_os = "none"))]
pub use host::{HostGuard as IrqSave, HostGuard as NoPreempt, HostGuard as NoPreemptIrqSave};
#[cfg(not(target_os = "none"))]
pub use host::critical_depth;
#[cfg(target_os = "none")]
pub use kernel::*;
