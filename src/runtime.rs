// SPDX-License-Identifier: Apache-2.0

//! Process-wide thread state

use crate::stats::{Event, Stats};
use crate::tcs::{Tcs, TcsMap};
use crate::{Config, Enclave, Error, Host, Tcb};

use libc::pid_t;

/// The thread lifecycle state of one enclave process
///
/// The runtime is created once at startup and is shared by every thread for
/// the rest of the process, so most methods take `&'static self`.
pub struct Runtime {
    pub(crate) map: TcsMap,
    pub(crate) stats: Stats,
    pub(crate) enclave: Box<dyn Enclave>,
    pub(crate) host: Box<dyn Host>,
}

impl Runtime {
    /// Creates the runtime of an enclave
    ///
    /// `tcs` is the address of the first of `config.thread_num` consecutive
    /// TCS pages of the enclave.
    pub fn new(
        config: &Config,
        tcs: *const Tcs,
        enclave: Box<dyn Enclave>,
        host: Box<dyn Host>,
    ) -> Self {
        Self {
            map: TcsMap::new(tcs, config.thread_num),
            stats: Stats::new(config.enable_stats),
            enclave,
            host,
        }
    }

    pub(crate) fn current(&self) -> Option<&Tcb> {
        // Safety: a TCB installed by this crate lives until its thread exits.
        self.host.tcb().map(|tcb| unsafe { &*tcb.as_ptr() })
    }

    /// The TCS bound to the calling thread
    pub fn current_tcs(&self) -> Option<*const Tcs> {
        self.current()?.tcs()
    }

    /// The thread bound to `tcs`
    ///
    /// Debuggers use this to find the host thread of an enclave thread.
    pub fn tid_of(&self, tcs: *const Tcs) -> Result<pid_t, Error> {
        self.map.tid_of(tcs)
    }

    /// The number of threads currently bound to a TCS
    pub fn count_bound(&self) -> usize {
        self.map.count_bound()
    }

    /// The number of TCS pages
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// The process-wide statistics
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Counts `event` on the calling thread
    ///
    /// Threads without a control block are not counted.
    pub fn record_event(&self, event: Event) {
        if let Some(tcb) = self.current() {
            tcb.bump(event);
        }
    }
}
