// SPDX-License-Identifier: Apache-2.0

//! Errors of the thread lifecycle

use std::io;

use libc::c_int;

/// A thread lifecycle error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// All TCS pages are bound to other threads
    #[error(
        "there are no available TCS pages left for a new thread; \
         please increase the thread count of the enclave (currently {capacity})"
    )]
    Exhausted {
        /// The configured number of TCS pages
        capacity: usize,
    },

    /// The GS base or the alternate signal stack could not be installed
    #[error("unable to set up thread")]
    Setup(#[source] io::Error),

    /// The thread memory could not be mapped
    #[error("unable to allocate thread memory")]
    Alloc(#[source] io::Error),

    /// The operating system refused to create the thread
    #[error("unable to create thread")]
    Spawn(#[source] io::Error),

    /// The TCS address is invalid or not bound to any thread
    #[error("TCS is not bound to a thread")]
    NotFound,
}

impl Error {
    /// The errno equivalent of this error
    ///
    /// Spawned threads report `-errno` as their exit status.
    pub fn errno(&self) -> c_int {
        match self {
            Self::Exhausted { .. } => libc::ENOMEM,
            Self::Setup(..) => libc::EPERM,
            Self::Alloc(..) => libc::ENOMEM,
            Self::Spawn(e) => e.raw_os_error().unwrap_or(libc::EAGAIN),
            Self::NotFound => libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::io;

    #[test]
    fn errno() {
        assert_eq!(Error::Exhausted { capacity: 2 }.errno(), libc::ENOMEM);
        assert_eq!(Error::Setup(io::ErrorKind::Other.into()).errno(), libc::EPERM);
        assert_eq!(Error::NotFound.errno(), libc::EINVAL);

        let spawn = Error::Spawn(io::Error::from_raw_os_error(libc::EAGAIN));
        assert_eq!(spawn.errno(), libc::EAGAIN);
    }

    #[test]
    fn exhausted_names_capacity() {
        let msg = Error::Exhausted { capacity: 7 }.to_string();
        assert!(msg.contains("(currently 7)"), "{msg}");
    }
}
