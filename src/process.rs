// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Fork/exec process supervisor (component E). Tracks live children in a set
//! owned by the control loop; a SIGCHLD handler does only signal-safe work
//! (non-blocking reap into a fixed-size array) and the main loop drains that
//! array each iteration.

use std::{
    ffi::CString,
    io,
    sync::atomic::{AtomicI32, Ordering},
    thread,
    time::{Duration, Instant},
};

const REAP_SLOTS: usize = 64;
const STOP_ATTEMPTS: u32 = 10;
const STOP_INTERVAL_NORMAL: Duration = Duration::from_secs(1);
const STOP_INTERVAL_FAST: Duration = Duration::from_millis(10);

static REAPED: [AtomicI32; REAP_SLOTS] = {
    const ZERO: AtomicI32 = AtomicI32::new(0);
    [ZERO; REAP_SLOTS]
};

/// Installed once at startup. Does only signal-safe work: reap any available
/// children non-blockingly and record their pids for the main loop to pick up.
pub fn install_sigchld_handler() {
    extern "C" fn handler(_signal: libc::c_int) {
        loop {
            let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            for slot in REAPED.iter() {
                if slot.compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                    break;
                }
            }
        }
    }

    unsafe {
        libc::signal(libc::SIGCHLD, handler as libc::sighandler_t);
    }
}

/// A live child, owned by the supervisor.
struct Child {
    pid: i32,
    label: String,
}

/// Tracks live children; mutated only by the main loop (reap slots are
/// populated by the signal handler, drained here).
#[derive(Default)]
pub struct ProcessSupervisor {
    children: Vec<Child>,
}

impl ProcessSupervisor {
    pub fn new() -> Self { ProcessSupervisor::default() }

    fn register(&mut self, pid: i32, label: &str) { self.children.push(Child { pid, label: label.to_owned() }); }

    /// Drains pids reaped by the SIGCHLD handler since the last call.
    pub fn reap(&mut self) {
        for slot in REAPED.iter() {
            let pid = slot.swap(0, Ordering::SeqCst);
            if pid != 0 {
                self.children.retain(|c| c.pid != pid);
            }
        }
    }

    pub fn is_running(&self, pid: i32) -> bool { self.children.iter().any(|c| c.pid == pid) }

    /// Sends SIGTERM to `pid`.
    pub fn stop(&self, pid: i32) {
        if self.is_running(pid) {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    /// Sends SIGTERM, escalating to SIGKILL after ten attempts. `fast` shortens
    /// the grace interval between attempts from 1s to 10ms.
    pub fn stop_wait(&mut self, pid: i32, fast: bool) {
        let interval = if fast { STOP_INTERVAL_FAST } else { STOP_INTERVAL_NORMAL };
        for attempt in 0..STOP_ATTEMPTS {
            self.reap();
            if !self.is_running(pid) {
                return;
            }
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            thread::sleep(interval);
            let _ = attempt;
        }
        self.reap();
        if self.is_running(pid) {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }

    /// Stops every tracked child, repeatedly taking the first until none remain.
    pub fn stop_all(&mut self, fast: bool) {
        while let Some(pid) = self.children.first().map(|c| c.pid) {
            self.stop_wait(pid, fast);
            self.children.retain(|c| c.pid != pid);
        }
    }
}

fn to_cstrings(argv: &[&str]) -> Vec<CString> { argv.iter().map(|a| CString::new(*a).unwrap()).collect() }

fn to_execv_argv(cstrings: &[CString]) -> Vec<*const libc::c_char> {
    cstrings.iter().map(|s| s.as_ptr()).chain(std::iter::once(std::ptr::null())).collect()
}

/// Blocks until `argv` exits or `timeout` elapses; on timeout, requests
/// termination then, after a grace period, kills. Returns `128 + signal` if
/// the child died from a signal, otherwise its exit code.
pub fn fork_wait(argv: &[&str], timeout: Duration) -> io::Result<i32> {
    let cstrings = to_cstrings(argv);
    let execv_argv = to_execv_argv(&cstrings);

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        unsafe {
            libc::execvp(execv_argv[0], execv_argv.as_ptr());
            libc::_exit(errno());
        }
    }

    let start = Instant::now();
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if ret == pid {
            return Ok(exit_code(status));
        }
        if start.elapsed() >= timeout {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            thread::sleep(Duration::from_secs(1));
            unsafe {
                libc::waitpid(pid, &mut status, libc::WNOHANG);
                libc::kill(pid, libc::SIGKILL);
                libc::waitpid(pid, &mut status, 0);
            }
            return Ok(exit_code(status));
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Forks a detached child whose stdout/stderr are redirected to `stderr_fd`,
/// with `ldpath` prepended onto the inherited `LD_LIBRARY_PATH`. Registers the
/// pid with `supervisor` on success.
pub fn fork_detached(
    supervisor: &mut ProcessSupervisor,
    label: &str,
    argv: &[&str],
    ldpath: &str,
    stderr_fd: i32,
) -> io::Result<i32> {
    let cstrings = to_cstrings(argv);
    let execv_argv = to_execv_argv(&cstrings);

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        unsafe {
            libc::dup2(stderr_fd, libc::STDOUT_FILENO);
            libc::dup2(stderr_fd, libc::STDERR_FILENO);
        }
        if !ldpath.is_empty() {
            let existing = std::env::var("LD_LIBRARY_PATH").unwrap_or_default();
            let combined =
                if existing.is_empty() { ldpath.to_owned() } else { format!("{}:{}", ldpath, existing) };
            std::env::set_var("LD_LIBRARY_PATH", combined);
        }
        unsafe {
            libc::execvp(execv_argv[0], execv_argv.as_ptr());
            libc::_exit(errno());
        }
    }

    supervisor.register(pid, label);
    Ok(pid)
}

/// Replaces the current process image with `argv`; on failure, exits with the
/// errno value (never returns on success).
pub fn exec_replace(argv: &[&str]) -> io::Error {
    let cstrings = to_cstrings(argv);
    let execv_argv = to_execv_argv(&cstrings);
    unsafe {
        libc::execvp(execv_argv[0], execv_argv.as_ptr());
    }
    io::Error::last_os_error()
}

fn errno() -> i32 { io::Error::last_os_error().raw_os_error().unwrap_or(1) }

fn exit_code(status: i32) -> i32 {
    unsafe {
        if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            libc::WEXITSTATUS(status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_tracks_and_reaps() {
        let mut sup = ProcessSupervisor::new();
        sup.register(12345, "test");
        assert!(sup.is_running(12345));
        REAPED[0].store(12345, Ordering::SeqCst);
        sup.reap();
        assert!(!sup.is_running(12345));
    }
}
