// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Signal handling for the control loop (SPEC_FULL.md §4.H, §5). Handlers do
//! only signal-safe work: close the listening socket and/or flip an atomic
//! flag. The main loop observes those flags once per iteration and logs and
//! acts on them there. SIGCHLD is handled entirely by `crate::process`.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Threshold past which further SIGPIPE occurrences stop being logged.
pub const SIGPIPE_LOG_THRESHOLD: u32 = 10;

static LISTEN_FD: AtomicI32 = AtomicI32::new(-1);
static FAST_SHUTDOWN: AtomicBool = AtomicBool::new(false);
static SIGHUP_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGPIPE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Registers the listening socket fd so SIGINT/SIGQUIT/SIGTERM can close it
/// from within the handler, which is what breaks the control loop out of its
/// blocking `poll` wait.
pub fn set_listen_fd(fd: i32) { LISTEN_FD.store(fd, Ordering::SeqCst); }

pub fn clear_listen_fd() { LISTEN_FD.store(-1, Ordering::SeqCst); }

extern "C" fn handle_shutdown_signal(signal: libc::c_int) {
    let fd = LISTEN_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
            libc::close(fd);
        }
    }
    if signal == libc::SIGTERM {
        FAST_SHUTDOWN.store(true, Ordering::SeqCst);
    }
}

extern "C" fn handle_sigpipe(_signal: libc::c_int) {
    SIGPIPE_COUNT.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn handle_sighup(_signal: libc::c_int) {
    SIGHUP_RECEIVED.store(true, Ordering::SeqCst);
}

/// Installs handlers for SIGINT, SIGQUIT, SIGTERM, SIGHUP, and SIGPIPE.
/// SIGCHLD is installed separately by `process::install_sigchld_handler`.
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, handle_sigpipe as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handle_sighup as libc::sighandler_t);
    }
}

/// SIGTERM asks for an immediate stop, skipping the graceful `stop_wait`
/// grace period on the secondary Xorg; SIGINT/SIGQUIT still wait for it.
pub fn is_fast_shutdown() -> bool { FAST_SHUTDOWN.load(Ordering::SeqCst) }

/// Consumes and returns whether a SIGHUP arrived since the last call.
pub fn take_sighup() -> bool { SIGHUP_RECEIVED.swap(false, Ordering::SeqCst) }

pub fn sigpipe_count() -> u32 { SIGPIPE_COUNT.load(Ordering::SeqCst) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sighup_flag_is_consumed_once() {
        SIGHUP_RECEIVED.store(true, Ordering::SeqCst);
        assert!(take_sighup());
        assert!(!take_sighup());
    }

    #[test]
    fn listen_fd_round_trips() {
        set_listen_fd(42);
        clear_listen_fd();
        assert_eq!(LISTEN_FD.load(Ordering::SeqCst), -1);
    }
}
