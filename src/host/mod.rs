// SPDX-License-Identifier: Apache-2.0

//! Operating system access
//!
//! The thread lifecycle needs a small set of host primitives. They are
//! collected in the [`Host`] trait so that the lifecycle logic can be
//! exercised without creating real threads.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux::Linux;

use crate::Tcb;

use std::fmt;
use std::io;
use std::ptr::NonNull;

use libc::{c_int, c_void, pid_t};
use tracing::Level;

/// The entry point of a new thread
///
/// The argument is the [`Tcb`] of the thread.
pub type ThreadEntry = extern "C" fn(*mut c_void) -> c_int;

/// The host primitives used by the thread lifecycle
///
/// Except for [`Host::map()`] and [`Host::create_thread()`], every method may
/// run on a thread without libc thread state and must not allocate.
pub trait Host: Send + Sync {
    /// Maps `size` bytes of zeroed, page-aligned, read-write memory
    fn map(&self, size: usize) -> io::Result<NonNull<u8>>;

    /// Unmaps memory returned by [`Host::map()`]
    ///
    /// # Safety
    ///
    /// `addr` and `size` must describe a mapping from [`Host::map()`] which
    /// is no longer used.
    unsafe fn unmap(&self, addr: NonNull<u8>, size: usize);

    /// Starts a new thread in the current thread group
    ///
    /// The thread runs `entry(arg)` on the stack whose initial stack pointer
    /// is `stack`. The thread never returns from `entry`.
    ///
    /// # Safety
    ///
    /// `stack` must point to the end of a mapping that stays valid until
    /// the new thread frees it.
    unsafe fn create_thread(
        &self,
        entry: ThreadEntry,
        stack: NonNull<u8>,
        arg: *mut c_void,
    ) -> io::Result<()>;

    /// Makes `tcb` the control block of the calling thread
    ///
    /// # Safety
    ///
    /// `tcb` must stay valid until it is replaced or the thread exits.
    unsafe fn set_tcb(&self, tcb: Option<NonNull<Tcb>>) -> io::Result<()>;

    /// The control block of the calling thread
    fn tcb(&self) -> Option<NonNull<Tcb>>;

    /// Installs an alternate signal stack for the calling thread
    ///
    /// # Safety
    ///
    /// `base` and `size` must describe memory that stays valid until the
    /// alternate stack is cleared.
    unsafe fn set_alt_stack(&self, base: NonNull<u8>, size: usize) -> io::Result<()>;

    /// Removes the alternate signal stack of the calling thread
    fn clear_alt_stack(&self);

    /// The kernel thread id of the calling thread
    fn gettid(&self) -> pid_t;

    /// Blocks delivery of `SIGTERM`, `SIGINT` and `SIGCONT` to the calling
    /// thread
    fn block_async_signals(&self);

    /// Unmaps `stack` (if any) and terminates the calling thread with
    /// `status`
    ///
    /// Once the memory is gone, nothing may touch the stack any more, so the
    /// two steps must happen without returning to the caller.
    ///
    /// # Safety
    ///
    /// `stack` and `size` must describe a mapping from [`Host::map()`]. The
    /// caller may be running on it.
    unsafe fn unmap_and_exit(&self, stack: Option<NonNull<u8>>, size: usize, status: c_int)
        -> !;

    /// Terminates the whole process with `status`
    fn exit_process(&self, status: c_int) -> !;

    /// Writes a diagnostic line to the host's error output
    ///
    /// This is how threads without libc thread state report errors and
    /// statistics. `tracing` dispatchers and libc's stdio may use thread
    /// locals or allocate, so neither can be used there.
    fn log(&self, level: Level, args: fmt::Arguments<'_>);
}
