// SPDX-License-Identifier: Apache-2.0

//! Thread creation and teardown
//!
//! A spawned thread owns one anonymous mapping that holds everything it
//! needs (recall that stacks grow towards lower addresses):
//!
//! ```text
//!       stack +--> +-------------------+
//!                  |  child stack      | THREAD_STACK_SIZE
//! child stack +--> +-------------------+
//!                  |  alternate stack  | ALT_STACK_SIZE - size_of::<Tcb>()
//!         tcb +--> +-------------------+
//!                  |  Tcb              | size_of::<Tcb>()
//!                  +-------------------+
//! ```
//!
//! The thread frees the mapping itself on exit, while still running on it.
//!
//! Spawned threads have no libc thread state of their own. Everything that
//! runs on them reports through [`Host::log()`](crate::Host::log) instead of
//! `tracing`, whose dispatchers may use thread locals and allocate.

use crate::host::ThreadEntry;
use crate::{Error, Runtime, Tcb};

use std::mem::size_of;
use std::ptr::NonNull;

use libc::{c_int, c_void};
use tracing::{debug, error, trace, Level};

/// The size of a page
pub const PAGE_SIZE: usize = 4096;

/// The size of the stack of a spawned thread
pub const THREAD_STACK_SIZE: usize = PAGE_SIZE * 512;

/// The size of the alternate signal stack, including the [`Tcb`]
pub const ALT_STACK_SIZE: usize = PAGE_SIZE * 16;

/// The size of the mapping of a spawned thread
pub const THREAD_MEM_SIZE: usize = THREAD_STACK_SIZE + ALT_STACK_SIZE;

/// Returns `base + offset`
///
/// # Safety
///
/// The result must stay within the mapping of `base`.
unsafe fn at(base: NonNull<u8>, offset: usize) -> NonNull<u8> {
    NonNull::new_unchecked(base.as_ptr().add(offset))
}

/// The entry point of every spawned thread
///
/// `arg` is the [`Tcb`] placed by [`Runtime::spawn_with()`].
extern "C" fn thread_start(arg: *mut c_void) -> c_int {
    // Safety: the TCB lives in the thread's mapping until the thread exits.
    let tcb = unsafe { &*(arg as *const Tcb) };
    let runtime = tcb.runtime();

    // Safety: `tcb` is the control block of this thread.
    let (status, entered) = match unsafe { runtime.init(tcb) } {
        Ok(()) => {
            runtime.enclave.start_thread(runtime);
            (0, true)
        }
        Err(e) => (-e.errno(), false),
    };

    // Safety: nothing on this stack is used after this point.
    unsafe { runtime.terminate(tcb, status, entered) }
}

impl Runtime {
    /// Writes a new [`Tcb`] to the last bytes of `region`
    unsafe fn place_tcb(
        &'static self,
        region: NonNull<u8>,
        size: usize,
        stack: Option<NonNull<u8>>,
        alt_stack: NonNull<u8>,
    ) -> &'static Tcb {
        let tcb = at(region, size - size_of::<Tcb>()).cast::<Tcb>();
        tcb.as_ptr().write(Tcb::new(self, stack, Some(alt_stack)));
        &*tcb.as_ptr()
    }

    /// Spawns a new thread that enters the enclave
    ///
    /// The thread runs [`Enclave::start_thread()`](crate::Enclave) once it
    /// has been bound to a TCS. Whether that succeeds is only known to the
    /// new thread; this returns as soon as the thread exists.
    pub fn spawn(&'static self) -> Result<(), Error> {
        self.spawn_with(thread_start)
    }

    /// Spawns a new thread that runs `entry`
    ///
    /// `entry` receives the [`Tcb`] of the new thread. It is expected to call
    /// [`Runtime::init()`] and to leave through [`Runtime::exit_thread()`].
    pub fn spawn_with(&'static self, entry: ThreadEntry) -> Result<(), Error> {
        let region = self.host.map(THREAD_MEM_SIZE).map_err(Error::Alloc)?;

        // Safety: `region` is a fresh mapping of `THREAD_MEM_SIZE` bytes.
        let (tcb, sp) = unsafe {
            let alt_stack = at(region, THREAD_STACK_SIZE);
            let tcb = self.place_tcb(region, THREAD_MEM_SIZE, Some(region), alt_stack);

            let sp = (alt_stack.as_ptr() as usize) & !0xf;
            (tcb, NonNull::new_unchecked(sp as *mut u8))
        };

        let arg = tcb as *const Tcb as *mut c_void;

        // Safety: the new thread owns `region` from now on.
        if let Err(e) = unsafe { self.host.create_thread(entry, sp, arg) } {
            // Safety: no thread was created, so nothing uses the mapping.
            unsafe { self.host.unmap(region, THREAD_MEM_SIZE) };
            return Err(Error::Spawn(e));
        }

        debug!(stack = ?region, "spawned thread");
        Ok(())
    }

    /// Prepares the calling thread for entering the enclave
    ///
    /// Installs `tcb` as the thread's GS base, registers its alternate
    /// signal stack and binds a free TCS to the thread.
    ///
    /// # Safety
    ///
    /// `tcb` must be the control block of the calling thread and must stay
    /// valid until the thread exits.
    pub unsafe fn init(&self, tcb: &Tcb) -> Result<(), Error> {
        self.host
            .set_tcb(Some(NonNull::from(tcb)))
            .map_err(Error::Setup)?;

        if let Some(alt_stack) = tcb.alt_stack() {
            self.host
                .set_alt_stack(alt_stack, ALT_STACK_SIZE - size_of::<Tcb>())
                .map_err(Error::Setup)?;
        }

        let tid = self.host.gettid();
        match self.map.bind(tid) {
            Some(tcs) => {
                tcb.set_tcs(tcs);
                Ok(())
            }

            None => {
                let err = Error::Exhausted {
                    capacity: self.map.capacity(),
                };
                self.host.log(Level::ERROR, format_args!("thread {tid}: {err}"));
                Err(err)
            }
        }
    }

    /// Prepares the original thread of the process
    ///
    /// The thread keeps its own stack but gets a control block, an
    /// alternate signal stack and a TCS. Afterwards the caller enters the
    /// enclave through its usual start routine.
    pub fn init_main_thread(&'static self) -> Result<(), Error> {
        let region = self.host.map(ALT_STACK_SIZE).map_err(Error::Alloc)?;

        // Safety: `region` is a fresh mapping of `ALT_STACK_SIZE` bytes which
        // is never unmapped unless initialization fails.
        unsafe {
            let tcb = self.place_tcb(region, ALT_STACK_SIZE, None, region);

            if let Err(e) = self.init(tcb) {
                self.host.clear_alt_stack();
                if let Err(e) = self.host.set_tcb(None) {
                    error!("unable to reset the GS base: {e}");
                }
                self.host.unmap(region, ALT_STACK_SIZE);
                return Err(e);
            }
        }

        trace!("initialized main thread");
        Ok(())
    }

    /// Releases the TCS of the calling thread, if it has one
    fn release(&self, tcb: &Tcb) {
        if let Some(tcs) = tcb.take_tcs() {
            self.map.unbind(tcs);
        }
    }

    /// Tears down `tcb` and terminates the calling thread
    ///
    /// Only threads that `entered` the enclave contribute to the statistics.
    ///
    /// # Safety
    ///
    /// `tcb` must be the control block of the calling thread. Its stack must
    /// not be used by anything but this call.
    unsafe fn terminate(&self, tcb: &Tcb, status: c_int, entered: bool) -> ! {
        self.host.block_async_signals();
        self.release(tcb);

        if entered {
            let tid = self.host.gettid();
            self.stats.record(tid, &tcb.counters(), false, |report| {
                self.host.log(Level::INFO, report)
            });
        }

        let stack = tcb.stack();
        if tcb.alt_stack().is_some() {
            if let Err(e) = self.host.set_tcb(None) {
                let errno = e.raw_os_error().unwrap_or(0);
                self.host.log(
                    Level::ERROR,
                    format_args!("unable to reset the GS base: errno {errno}"),
                );
            }
            self.host.clear_alt_stack();
        }

        self.host.unmap_and_exit(stack, THREAD_MEM_SIZE, status)
    }

    /// Terminates the calling thread with `status`
    ///
    /// A TCS still bound to the thread is released. If the runtime owns the
    /// thread's stack, it is unmapped as well.
    ///
    /// # Panics
    ///
    /// Aborts the process if the calling thread has no [`Tcb`].
    pub fn exit_thread(&self, status: c_int) -> ! {
        match self.current() {
            // Safety: the current TCB belongs to the calling thread.
            Some(tcb) => unsafe { self.terminate(tcb, status, true) },

            None => {
                self.host.log(
                    Level::ERROR,
                    format_args!("exiting thread has no control block"),
                );
                std::process::abort()
            }
        }
    }

    /// Handles an exit request of an enclave thread
    ///
    /// With `exit_group` set, or when the calling thread was the last one
    /// bound to a TCS, the whole process exits. Otherwise only the calling
    /// thread terminates. Exit codes are truncated to 255.
    pub fn exit_enclave_thread(&self, code: c_int, exit_group: bool) -> ! {
        let code = match u8::try_from(code) {
            Ok(code) => c_int::from(code),
            Err(_) => {
                self.host.log(
                    Level::DEBUG,
                    format_args!("saturating exit code {code} to 255"),
                );
                255
            }
        };

        let tcb = self.current();

        if exit_group {
            self.exit_process(tcb, code);
        }

        self.host.block_async_signals();
        self.enclave.reset_thread(self);
        if let Some(tcb) = tcb {
            self.release(tcb);
        }

        // The counters are read only now, so events of `reset_thread()` are
        // part of the totals.
        if self.map.count_bound() == 0 {
            self.exit_process(tcb, code);
        }

        self.exit_thread(code)
    }

    fn exit_process(&self, tcb: Option<&Tcb>, code: c_int) -> ! {
        let counters = tcb.map(Tcb::counters).unwrap_or_default();
        let tid = self.host.gettid();
        self.stats.record(tid, &counters, true, |report| self.host.log(Level::INFO, report));
        self.host.exit_process(code)
    }
}
