// SPDX-License-Identifier: Apache-2.0

//! TCS bookkeeping
//!
//! The enclave contains a fixed array of TCS pages. Each page can be entered
//! by at most one thread at a time, so the [`TcsMap`] records which host
//! thread currently owns which page.

use crate::Error;

use std::mem::size_of;

use libc::pid_t;
use spin::Mutex;

/// A Thread Control Structure page inside the enclave
///
/// The contents are only accessible to the CPU, so the host never reads
/// them. Only the address matters.
#[repr(C, align(4096))]
pub struct Tcs([u8; 4096]);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Entry {
    /// The bound host thread, `0` when free
    tid: pid_t,
    tcs: *const Tcs,
}

// The TCS address is never dereferenced by the host.
unsafe impl Send for Entry {}

/// Maps host threads to TCS pages
///
/// Binding and unbinding happen on threads without libc thread state, so
/// nothing here logs.
#[derive(Debug)]
pub struct TcsMap {
    base: *const Tcs,
    capacity: usize,
    entries: Mutex<Box<[Entry]>>,
}

// `base` is only used for address arithmetic.
unsafe impl Send for TcsMap {}
unsafe impl Sync for TcsMap {}

impl TcsMap {
    /// Creates a map of `count` unbound TCS pages starting at `base`
    pub fn new(base: *const Tcs, count: usize) -> Self {
        let entries = (0..count)
            .map(|i| Entry {
                tid: 0,
                tcs: base.wrapping_add(i),
            })
            .collect();

        Self {
            base,
            capacity: count,
            entries: Mutex::new(entries),
        }
    }

    /// The number of TCS pages
    ///
    /// The table never changes size, so this does not take the lock.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Binds the first free TCS to `tid`
    ///
    /// Returns `None` if all TCS pages are in use.
    pub fn bind(&self, tid: pid_t) -> Option<*const Tcs> {
        debug_assert_ne!(tid, 0);

        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| e.tid == 0)?;
        entry.tid = tid;
        Some(entry.tcs)
    }

    /// Releases a TCS previously returned by [`TcsMap::bind()`]
    ///
    /// # Panics
    ///
    /// Panics if `tcs` is not a bound TCS of this map. The map is shared by
    /// all threads, so continuing with inconsistent bookkeeping is not an
    /// option.
    pub fn unbind(&self, tcs: *const Tcs) {
        let mut entries = self.entries.lock();

        let index = match self.index(tcs) {
            Some(index) => index,
            None => panic!("TCS {tcs:p} is not part of the enclave"),
        };

        let entry = &mut entries[index];
        assert_ne!(entry.tid, 0, "TCS {tcs:p} is not bound");
        entry.tid = 0;
    }

    /// The number of TCS pages bound to a thread
    pub fn count_bound(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.tid != 0).count()
    }

    /// Finds the thread bound to `tcs`
    pub fn tid_of(&self, tcs: *const Tcs) -> Result<pid_t, Error> {
        let entries = self.entries.lock();

        let index = self.index(tcs).ok_or(Error::NotFound)?;
        match entries[index].tid {
            0 => Err(Error::NotFound),
            tid => Ok(tid),
        }
    }

    fn index(&self, tcs: *const Tcs) -> Option<usize> {
        let offset = (tcs as usize).checked_sub(self.base as usize)?;
        if offset % size_of::<Tcs>() != 0 {
            return None;
        }

        let index = offset / size_of::<Tcs>();
        (index < self.capacity).then_some(index)
    }
}
