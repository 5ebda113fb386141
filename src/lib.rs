// SPDX-License-Identifier: Apache-2.0

//! Untrusted-runtime thread lifecycle for SGX enclaves
//!
//! Every thread that executes enclave code needs two things on the host side:
//! an operating system thread to run on and a Thread Control Structure (TCS)
//! inside the enclave to enter through. The number of TCS pages is fixed when
//! the enclave is built, so this crate manages them as a pool:
//!
//!   1. [`Runtime::spawn()`] maps a stack, an alternate signal stack and a
//!      thread control block ([`Tcb`]) in one region and clones a new thread
//!      onto it.
//!
//!   2. The new thread installs its [`Tcb`] as its GS base, registers the
//!      alternate signal stack and binds a free TCS from the [`TcsMap`].
//!      Without a free TCS the thread gives up before running any enclave
//!      code.
//!
//!   3. The thread then runs [`Enclave::start_thread()`]. Once the enclave
//!      work is done, [`Runtime::exit_thread()`] folds the thread's counters
//!      into the process-wide [`Stats`], releases the TCS, unmaps the region
//!      (including the stack it is running on) and terminates the thread.
//!
//! The process's original thread goes through the same initialization via
//! [`Runtime::init_main_thread()`] but keeps the stack the kernel gave it.
//!
//! All operating system access goes through the [`Host`] trait;
//! [`host::Linux`] is the implementation for x86_64 Linux. Spawned threads
//! share the libc thread state of their parent, so they report errors and
//! statistics through [`Host::log()`] rather than `tracing`.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod enclave;
pub mod error;
pub mod host;
pub mod runtime;
pub mod stats;
pub mod tcb;
pub mod tcs;
pub mod thread;

pub use config::Config;
pub use enclave::Enclave;
pub use error::Error;
pub use host::Host;
pub use runtime::Runtime;
pub use stats::{Counters, Event, Stats};
pub use tcb::Tcb;
pub use tcs::{Tcs, TcsMap};
