// SPDX-License-Identifier: Apache-2.0

//! Thread control block
//!
//! Every thread that may enter the enclave owns one [`Tcb`]. The GS segment
//! base of the thread points to it, so it can be found from any code running
//! on the thread, including the enclave exit path.

use crate::stats::{Counters, Event};
use crate::thread::ALT_STACK_SIZE;
use crate::tcs::Tcs;
use crate::Runtime;

use std::cell::Cell;
use std::mem::size_of;
use std::ptr::{null, NonNull};

// The TCB lives in the last bytes of the alternate stack region.
const _: () = assert!(size_of::<Tcb>() < ALT_STACK_SIZE);

/// The control block of a host thread
#[repr(C)]
pub struct Tcb {
    runtime: &'static Runtime,
    tcs: Cell<*const Tcs>,
    stack: Option<NonNull<u8>>,
    alt_stack: Option<NonNull<u8>>,
    counters: Cell<Counters>,
}

impl Tcb {
    /// Creates the control block of a thread without a TCS
    ///
    /// `stack` is `None` for the original thread of the process, whose stack
    /// is not owned by the runtime.
    pub fn new(
        runtime: &'static Runtime,
        stack: Option<NonNull<u8>>,
        alt_stack: Option<NonNull<u8>>,
    ) -> Self {
        Self {
            runtime,
            tcs: Cell::new(null()),
            stack,
            alt_stack,
            counters: Cell::default(),
        }
    }

    /// The runtime this thread belongs to
    pub fn runtime(&self) -> &'static Runtime {
        self.runtime
    }

    /// The TCS bound to this thread
    pub fn tcs(&self) -> Option<*const Tcs> {
        let tcs = self.tcs.get();
        (!tcs.is_null()).then_some(tcs)
    }

    pub(crate) fn set_tcs(&self, tcs: *const Tcs) {
        self.tcs.set(tcs);
    }

    /// Forgets the bound TCS, returning it
    pub(crate) fn take_tcs(&self) -> Option<*const Tcs> {
        let tcs = self.tcs();
        self.tcs.set(null());
        tcs
    }

    /// Base of the thread stack, if owned by the runtime
    pub fn stack(&self) -> Option<NonNull<u8>> {
        self.stack
    }

    /// Base of the alternate signal stack
    pub fn alt_stack(&self) -> Option<NonNull<u8>> {
        self.alt_stack
    }

    /// The statistics of this thread so far
    pub fn counters(&self) -> Counters {
        self.counters.get()
    }

    /// Counts one `event` on this thread
    pub fn bump(&self, event: Event) {
        let mut counters = self.counters.get();
        counters.bump(event);
        self.counters.set(counters);
    }
}
