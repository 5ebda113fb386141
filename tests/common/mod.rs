// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_void, pid_t};
use sgx_urts::host::ThreadEntry;
use sgx_urts::{Config, Counters, Enclave, Event, Host, Runtime, Tcb, Tcs};
use tracing::Level;

pub const TIMEOUT_SECS: u64 = 10;
pub const TCS_BASE: usize = 0x7f00_0000_0000;

static NEXT_TID: AtomicI32 = AtomicI32::new(1000);

thread_local! {
    static TID: pid_t = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    static TCB: Cell<*mut Tcb> = Cell::new(null_mut());
}

/// Polls `done` until it holds, panicking after `TIMEOUT_SECS`
pub fn wait_until(what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(TIMEOUT_SECS);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn tcs(index: usize) -> *const Tcs {
    (TCS_BASE + index * 4096) as *const Tcs
}

#[derive(Default)]
pub struct Record {
    pub fail_map: AtomicBool,
    pub fail_clone: AtomicBool,
    pub fail_set_tcb: AtomicBool,
    pub fail_alt_stack: AtomicBool,

    pub maps: AtomicUsize,
    pub clones: AtomicUsize,
    pub blocked: AtomicUsize,

    /// Live mappings, by address
    pub live: Mutex<HashMap<usize, usize>>,
    /// Unmapped addresses, in order
    pub freed: Mutex<Vec<usize>>,
    /// Thread exit statuses, in order
    pub exits: Mutex<Vec<c_int>>,
    /// Process exit statuses, in order
    pub process_exits: Mutex<Vec<c_int>>,
    /// Diagnostic lines, in order
    pub logs: Mutex<Vec<(Level, String)>>,
}

impl Record {
    pub fn exits(&self) -> Vec<c_int> {
        self.exits.lock().unwrap().clone()
    }

    pub fn process_exits(&self) -> Vec<c_int> {
        self.process_exits.lock().unwrap().clone()
    }

    pub fn freed(&self) -> Vec<usize> {
        self.freed.lock().unwrap().clone()
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Diagnostic lines containing `needle`
    pub fn logged(&self, needle: &str) -> Vec<(Level, String)> {
        let logs = self.logs.lock().unwrap();
        logs.iter().filter(|(_, line)| line.contains(needle)).cloned().collect()
    }
}

struct SendPtr(*mut c_void);

// The pointer is handed to exactly one thread.
unsafe impl Send for SendPtr {}

/// A host that runs threads on `std::thread` and records what happens
#[derive(Clone, Default)]
pub struct RecordingHost(pub Arc<Record>);

impl RecordingHost {
    fn error(errno: c_int) -> io::Error {
        io::Error::from_raw_os_error(errno)
    }

    fn park() -> ! {
        loop {
            thread::park();
        }
    }
}

impl Host for RecordingHost {
    fn map(&self, size: usize) -> io::Result<NonNull<u8>> {
        if self.0.fail_map.load(Ordering::SeqCst) {
            return Err(Self::error(libc::ENOMEM));
        }

        let layout = Layout::from_size_align(size, 4096).unwrap();
        let addr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();

        self.0.maps.fetch_add(1, Ordering::SeqCst);
        self.0.live.lock().unwrap().insert(addr.as_ptr() as usize, size);
        Ok(addr)
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, size: usize) {
        let addr = addr.as_ptr();

        let mapped = self.0.live.lock().unwrap().remove(&(addr as usize));
        assert_eq!(mapped, Some(size), "bad unmap of {addr:p}");
        self.0.freed.lock().unwrap().push(addr as usize);

        dealloc(addr, Layout::from_size_align(size, 4096).unwrap());
    }

    unsafe fn create_thread(
        &self,
        entry: ThreadEntry,
        stack: NonNull<u8>,
        arg: *mut c_void,
    ) -> io::Result<()> {
        assert_eq!(stack.as_ptr() as usize % 16, 0);

        if self.0.fail_clone.load(Ordering::SeqCst) {
            return Err(Self::error(libc::EAGAIN));
        }

        self.0.clones.fetch_add(1, Ordering::SeqCst);

        let arg = SendPtr(arg);
        thread::spawn(move || {
            let arg = arg;
            entry(arg.0)
        });

        Ok(())
    }

    unsafe fn set_tcb(&self, tcb: Option<NonNull<Tcb>>) -> io::Result<()> {
        if tcb.is_some() && self.0.fail_set_tcb.load(Ordering::SeqCst) {
            return Err(Self::error(libc::EINVAL));
        }

        TCB.with(|cell| cell.set(tcb.map_or(null_mut(), NonNull::as_ptr)));
        Ok(())
    }

    fn tcb(&self) -> Option<NonNull<Tcb>> {
        TCB.with(|cell| NonNull::new(cell.get()))
    }

    unsafe fn set_alt_stack(&self, _base: NonNull<u8>, _size: usize) -> io::Result<()> {
        if self.0.fail_alt_stack.load(Ordering::SeqCst) {
            return Err(Self::error(libc::ENOMEM));
        }

        Ok(())
    }

    fn clear_alt_stack(&self) {}

    fn gettid(&self) -> pid_t {
        TID.with(|tid| *tid)
    }

    fn block_async_signals(&self) {
        self.0.blocked.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn unmap_and_exit(&self, stack: Option<NonNull<u8>>, size: usize, status: c_int) -> ! {
        if let Some(stack) = stack {
            self.unmap(stack, size);
        }

        self.0.exits.lock().unwrap().push(status);
        Self::park()
    }

    fn exit_process(&self, status: c_int) -> ! {
        self.0.process_exits.lock().unwrap().push(status);
        Self::park()
    }

    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        self.0.logs.lock().unwrap().push((level, args.to_string()));
    }
}

/// What the enclave does once a thread has entered it
#[derive(Default)]
pub struct Script {
    /// Closed gates hold threads inside the enclave
    pub gate: AtomicBool,
    pub started: AtomicUsize,
    pub resets: AtomicUsize,

    /// Events counted by every thread
    pub events: Counters,
    /// Events counted while a thread is reset on its way out
    pub reset_events: Counters,
    /// Leave through the enclave exit request instead of returning
    pub exit: Option<(c_int, bool)>,

    /// The TCS each thread was started on
    pub tcs: Mutex<Vec<usize>>,
}

impl Script {
    pub fn open() -> Self {
        Self {
            gate: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn release(&self) {
        self.gate.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct ScriptedEnclave(pub Arc<Script>);

impl Enclave for ScriptedEnclave {
    fn start_thread(&self, runtime: &Runtime) {
        let tcs = runtime.current_tcs().expect("started without a TCS");
        self.0.tcs.lock().unwrap().push(tcs as usize);
        self.0.started.fetch_add(1, Ordering::SeqCst);

        count(runtime, &self.0.events);

        while !self.0.gate.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        if let Some((code, exit_group)) = self.0.exit {
            runtime.exit_enclave_thread(code, exit_group);
        }
    }

    fn reset_thread(&self, runtime: &Runtime) {
        count(runtime, &self.0.reset_events);
        self.0.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records `counters` as events of the calling thread
fn count(runtime: &Runtime, counters: &Counters) {
    let events = [
        (Event::EEnter, counters.eenter),
        (Event::EExit, counters.eexit),
        (Event::Aex, counters.aex),
        (Event::SyncSignal, counters.sync_signal),
        (Event::AsyncSignal, counters.async_signal),
    ];

    for (event, count) in events {
        for _ in 0..count {
            runtime.record_event(event);
        }
    }
}

/// A runtime living for the rest of the test process
pub struct Fixture {
    pub runtime: &'static Runtime,
    pub host: Arc<Record>,
    pub script: Arc<Script>,
}

impl Fixture {
    pub fn new(thread_num: usize, enable_stats: bool, script: Script) -> Self {
        let config = Config {
            thread_num,
            enable_stats,
        };

        let host = RecordingHost::default();
        let script = Arc::new(script);

        let runtime = Runtime::new(
            &config,
            tcs(0),
            Box::new(ScriptedEnclave(script.clone())),
            Box::new(host.clone()),
        );

        Self {
            runtime: Box::leak(Box::new(runtime)),
            host: host.0,
            script,
        }
    }

    /// Waits until `count` threads have exited
    pub fn wait_exits(&self, count: usize) -> Vec<c_int> {
        wait_until("thread exits", || self.host.exits.lock().unwrap().len() >= count);
        self.host.exits()
    }
}
