// SPDX-License-Identifier: Apache-2.0

//! x86_64 Linux host
//!
//! Threads created here come from a raw `clone()` and share the FS base (and
//! with it the libc thread state) of their parent. Everything that can run
//! on such a thread therefore issues system calls directly, reports errors
//! without going through `errno` and writes diagnostics with a plain
//! `write(2)` from a stack buffer.

use super::{Host, ThreadEntry};
use crate::Tcb;

use std::arch::asm;
use std::fmt::{self, Write};
use std::io;
use std::mem::{forget, size_of};
use std::ptr::{null, null_mut, NonNull};

use libc::{c_int, c_long, c_void, pid_t, stack_t};
use mmarinus::{perms, Map};
use tracing::level_filters::LevelFilter;
use tracing::{trace, Level};

const ARCH_SET_GS: c_int = 0x1001;
const ARCH_GET_GS: c_int = 0x1004;

const ASYNC_SIGNALS: u64 =
    (1 << (libc::SIGTERM - 1)) | (1 << (libc::SIGINT - 1)) | (1 << (libc::SIGCONT - 1));

#[inline(always)]
unsafe fn syscall(nr: c_long, a: usize, b: usize, c: usize, d: usize) -> io::Result<usize> {
    let rax: isize;

    asm!(
        "syscall",
        inlateout("rax") nr as isize => rax,
        in("rdi") a,
        in("rsi") b,
        in("rdx") c,
        in("r10") d,
        lateout("rcx") _, // clobbered
        lateout("r11") _, // clobbered
        options(nostack),
    );

    match rax {
        n if (-4095..0).contains(&n) => Err(io::Error::from_raw_os_error(-n as i32)),
        n => Ok(n as usize),
    }
}

/// Formats into a stack buffer and writes it to stderr
///
/// A line that fits the buffer is written with a single `write(2)`, so lines
/// of concurrent threads do not interleave.
struct Stderr {
    buf: [u8; 512],
    len: usize,
}

impl Stderr {
    fn new() -> Self {
        Self {
            buf: [0; 512],
            len: 0,
        }
    }

    fn flush(&mut self) {
        let mut data = &self.buf[..self.len];

        while !data.is_empty() {
            // Safety: the kernel only reads `data`.
            let ret = unsafe {
                syscall(
                    libc::SYS_write,
                    libc::STDERR_FILENO as usize,
                    data.as_ptr() as usize,
                    data.len(),
                    0,
                )
            };

            match ret {
                Ok(n) if n > 0 => data = &data[n..],
                _ => break,
            }
        }

        self.len = 0;
    }
}

impl Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();

        while !bytes.is_empty() {
            if self.len == self.buf.len() {
                self.flush();
            }

            let n = bytes.len().min(self.buf.len() - self.len);
            self.buf[self.len..][..n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }

        Ok(())
    }
}

/// The x86_64 Linux host
#[derive(Copy, Clone, Debug, Default)]
pub struct Linux;

impl Host for Linux {
    fn map(&self, size: usize) -> io::Result<NonNull<u8>> {
        let map = Map::bytes(size)
            .anywhere()
            .anonymously()
            .with(perms::ReadWrite)
            .map_err(|e| e.err)?;

        let addr = NonNull::new(map.addr() as *mut u8)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

        // Skip `drop()`. The mapping is released by `unmap()` or by the
        // thread that runs on it.
        forget(map);
        Ok(addr)
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, size: usize) {
        if let Err(e) = syscall(libc::SYS_munmap, addr.as_ptr() as usize, size, 0, 0) {
            let errno = e.raw_os_error().unwrap_or(0);
            self.log(Level::ERROR, format_args!("munmap({addr:p}, {size}) failed: errno {errno}"));
        }
    }

    unsafe fn create_thread(
        &self,
        entry: ThreadEntry,
        stack: NonNull<u8>,
        arg: *mut c_void,
    ) -> io::Result<()> {
        let flags = libc::CLONE_VM
            | libc::CLONE_FS
            | libc::CLONE_FILES
            | libc::CLONE_SYSVSEM
            | libc::CLONE_THREAD
            | libc::CLONE_SIGHAND
            | libc::CLONE_PARENT_SETTID;

        let mut tid: pid_t = 0;
        match libc::clone(entry, stack.as_ptr().cast(), flags, arg, &mut tid as *mut pid_t) {
            -1 => Err(io::Error::last_os_error()),
            _ => {
                trace!(tid, "cloned thread");
                Ok(())
            }
        }
    }

    unsafe fn set_tcb(&self, tcb: Option<NonNull<Tcb>>) -> io::Result<()> {
        let addr = tcb.map_or(0, |tcb| tcb.as_ptr() as usize);
        syscall(libc::SYS_arch_prctl, ARCH_SET_GS as usize, addr, 0, 0)?;
        Ok(())
    }

    fn tcb(&self) -> Option<NonNull<Tcb>> {
        let mut addr: usize = 0;

        // Safety: the kernel writes the GS base to `addr`.
        let ret = unsafe {
            syscall(
                libc::SYS_arch_prctl,
                ARCH_GET_GS as usize,
                &mut addr as *mut usize as usize,
                0,
                0,
            )
        };

        ret.ok().and_then(|_| NonNull::new(addr as *mut Tcb))
    }

    unsafe fn set_alt_stack(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        let ss = stack_t {
            ss_sp: base.as_ptr().cast(),
            ss_flags: 0,
            ss_size: size,
        };

        syscall(libc::SYS_sigaltstack, &ss as *const stack_t as usize, 0, 0, 0)?;
        Ok(())
    }

    fn clear_alt_stack(&self) {
        let ss = stack_t {
            ss_sp: null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };

        // Safety: disabling the alternate stack does not touch any memory.
        // It fails only while the thread runs on the alternate stack, which
        // leaves it in place.
        let ret = unsafe { syscall(libc::SYS_sigaltstack, &ss as *const stack_t as usize, 0, 0, 0) };
        if let Err(e) = ret {
            let errno = e.raw_os_error().unwrap_or(0);
            self.log(Level::ERROR, format_args!("sigaltstack() failed: errno {errno}"));
        }
    }

    fn gettid(&self) -> pid_t {
        // Safety: gettid() cannot fail.
        unsafe { syscall(libc::SYS_gettid, 0, 0, 0, 0) }.map_or(0, |tid| tid as pid_t)
    }

    fn block_async_signals(&self) {
        let set = ASYNC_SIGNALS;

        // Safety: the kernel only reads the signal set.
        let ret = unsafe {
            syscall(
                libc::SYS_rt_sigprocmask,
                libc::SIG_BLOCK as usize,
                &set as *const u64 as usize,
                null::<u64>() as usize,
                size_of::<u64>(),
            )
        };

        if let Err(e) = ret {
            let errno = e.raw_os_error().unwrap_or(0);
            self.log(Level::ERROR, format_args!("rt_sigprocmask() failed: errno {errno}"));
        }
    }

    unsafe fn unmap_and_exit(&self, stack: Option<NonNull<u8>>, size: usize, status: c_int) -> ! {
        let addr = stack.map_or(null_mut(), NonNull::as_ptr);

        // After munmap() the stack is gone. Everything the exit needs is in
        // registers before it runs.
        asm!(
            "test rdi, rdi",
            "jz 2f",
            "syscall",       // munmap(rdi, rsi)
            "2:",
            "mov rax, r8",
            "mov edi, edx",
            "syscall",       // exit(edi)
            "ud2",
            in("rax") libc::SYS_munmap,
            in("rdi") addr,
            in("rsi") size,
            in("rdx") status,
            in("r8") libc::SYS_exit,
            options(noreturn, nostack),
        )
    }

    fn exit_process(&self, status: c_int) -> ! {
        // Safety: exit_group() does not return.
        unsafe {
            asm!(
                "syscall",
                "ud2",
                in("rax") libc::SYS_exit_group,
                in("rdi") status,
                options(noreturn, nostack),
            )
        }
    }

    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        // The global maximum is a plain atomic, unlike the dispatcher.
        if level > LevelFilter::current() {
            return;
        }

        let mut out = Stderr::new();
        let _ = writeln!(out, "{level:>5} sgx_urts: {args}");
        out.flush();
    }
}
