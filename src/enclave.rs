// SPDX-License-Identifier: Apache-2.0

//! The enclave collaborator

use crate::Runtime;

/// The enclave side of the thread lifecycle
///
/// Both methods are called on the thread they concern, after it has been
/// bound to a TCS, and they must not allocate: spawned threads have no libc
/// thread state.
pub trait Enclave: Send + Sync {
    /// Runs a new thread inside the enclave
    ///
    /// This returns once the enclave is done with the thread. The TCS of the
    /// calling thread is available through [`Runtime::current_tcs()`].
    fn start_thread(&self, runtime: &Runtime);

    /// Resets the enclave state of the calling thread before it exits
    fn reset_thread(&self, _runtime: &Runtime) {}
}
