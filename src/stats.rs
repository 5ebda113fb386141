// SPDX-License-Identifier: Apache-2.0

//! SGX statistics
//!
//! Every thread counts its enclave transitions and signals in its own
//! [`Tcb`](crate::Tcb). When the thread exits, the counters are folded into
//! the process-wide [`Stats`].

use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use libc::pid_t;

/// An event counted per thread
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The thread entered the enclave (`EENTER`)
    EEnter,
    /// The thread left the enclave synchronously (`EEXIT`)
    EExit,
    /// The thread left the enclave asynchronously (AEX)
    Aex,
    /// A synchronous signal (e.g. `SIGSEGV`) was delivered to the thread
    SyncSignal,
    /// An asynchronous signal (e.g. `SIGTERM`) was delivered to the thread
    AsyncSignal,
}

/// SGX statistics counters
///
/// All arithmetic wraps around.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Number of `EENTER`s
    pub eenter: u64,
    /// Number of `EEXIT`s
    pub eexit: u64,
    /// Number of asynchronous enclave exits
    pub aex: u64,
    /// Number of synchronous signals
    pub sync_signal: u64,
    /// Number of asynchronous signals
    pub async_signal: u64,
}

impl Counters {
    /// Counts one `event`
    pub fn bump(&mut self, event: Event) {
        let counter = match event {
            Event::EEnter => &mut self.eenter,
            Event::EExit => &mut self.eexit,
            Event::Aex => &mut self.aex,
            Event::SyncSignal => &mut self.sync_signal,
            Event::AsyncSignal => &mut self.async_signal,
        };

        *counter = counter.wrapping_add(1);
    }
}

impl AddAssign for Counters {
    fn add_assign(&mut self, rhs: Self) {
        self.eenter = self.eenter.wrapping_add(rhs.eenter);
        self.eexit = self.eexit.wrapping_add(rhs.eexit);
        self.aex = self.aex.wrapping_add(rhs.aex);
        self.sync_signal = self.sync_signal.wrapping_add(rhs.sync_signal);
        self.async_signal = self.async_signal.wrapping_add(rhs.async_signal);
    }
}

/// The subject of a statistics report
#[derive(Copy, Clone, Debug)]
enum Scope {
    Thread(pid_t),
    Process(pid_t),
}

/// A human-readable statistics report
///
/// Formatting does not allocate, so reports can be written from threads that
/// have no libc thread state.
struct Report {
    scope: Scope,
    counters: Counters,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Thread(tid) => writeln!(f, "----- SGX stats for thread {tid} -----")?,
            Scope::Process(pid) => writeln!(f, "----- Total SGX stats for process {pid} -----")?,
        }

        writeln!(f, "  # of EENTERs:        {}", self.counters.eenter)?;
        writeln!(f, "  # of EEXITs:         {}", self.counters.eexit)?;
        writeln!(f, "  # of AEXs:           {}", self.counters.aex)?;
        writeln!(f, "  # of sync signals:   {}", self.counters.sync_signal)?;
        write!(f, "  # of async signals:  {}", self.counters.async_signal)
    }
}

/// Process-wide SGX statistics
#[derive(Debug, Default)]
pub struct Stats {
    enabled: bool,
    eenter: AtomicU64,
    eexit: AtomicU64,
    aex: AtomicU64,
    sync_signal: AtomicU64,
    async_signal: AtomicU64,
}

impl Stats {
    /// Creates zeroed statistics
    ///
    /// When `enabled` is false, [`Stats::record()`] does nothing.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    /// Whether statistics are collected
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Folds the final counters of thread `tid` into the process totals
    ///
    /// This is called once per thread when it exits. The thread's counters
    /// are handed to `report` as text. With `process_wide` set, the
    /// accumulated totals are reported as well, which is done once when the
    /// process exits.
    pub fn record(
        &self,
        tid: pid_t,
        counters: &Counters,
        process_wide: bool,
        mut report: impl FnMut(fmt::Arguments<'_>),
    ) {
        if !self.enabled {
            return;
        }

        let thread = Report {
            scope: Scope::Thread(tid),
            counters: *counters,
        };
        report(format_args!("{thread}"));

        // `fetch_add` wraps around on overflow.
        self.eenter.fetch_add(counters.eenter, Ordering::Relaxed);
        self.eexit.fetch_add(counters.eexit, Ordering::Relaxed);
        self.aex.fetch_add(counters.aex, Ordering::Relaxed);
        self.sync_signal
            .fetch_add(counters.sync_signal, Ordering::Relaxed);
        self.async_signal
            .fetch_add(counters.async_signal, Ordering::Relaxed);

        if process_wide {
            let process = Report {
                scope: Scope::Process(std::process::id() as pid_t),
                counters: self.totals(),
            };
            report(format_args!("{process}"));
        }
    }

    /// A snapshot of the process totals
    pub fn totals(&self) -> Counters {
        Counters {
            eenter: self.eenter.load(Ordering::Relaxed),
            eexit: self.eexit.load(Ordering::Relaxed),
            aex: self.aex.load(Ordering::Relaxed),
            sync_signal: self.sync_signal.load(Ordering::Relaxed),
            async_signal: self.async_signal.load(Ordering::Relaxed),
        }
    }
}
