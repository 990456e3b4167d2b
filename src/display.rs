// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Secondary display-server supervisor (component F): starts and stops the
//! isolated Xorg instance bound to the discrete GPU, probes it for readiness,
//! and classifies its stderr output.

use crate::{power, process, state::ServiceContext};
use std::{
    io,
    os::unix::{io::RawFd, net::UnixStream},
    time::{Duration, Instant},
};

const LINE_BUFFER_SIZE: usize = 512;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_RETRY_INTERVAL: Duration = Duration::from_millis(200);

const SENTINEL: RawFd = -1;

/// Substitutes every occurrence of the `DRIVER` placeholder token in an Xorg
/// config path with the configured driver name.
pub fn xorg_path_with_driver(path: &str, driver: &str) -> String { path.replace("DRIVER", driver) }

pub struct DisplayHandle {
    pid: Option<i32>,
    stderr_read_fd: RawFd,
    stderr_write_fd: RawFd,
    ready: bool,
    buffer: LineBuffer,
}

impl Default for DisplayHandle {
    fn default() -> Self {
        DisplayHandle {
            pid: None,
            stderr_read_fd: SENTINEL,
            stderr_write_fd: SENTINEL,
            ready: false,
            buffer: LineBuffer::new(),
        }
    }
}

impl DisplayHandle {
    pub fn new() -> Self { DisplayHandle::default() }

    pub fn is_alive(&self, supervisor: &process::ProcessSupervisor) -> bool {
        self.pid.map_or(false, |pid| supervisor.is_running(pid))
    }

    pub fn is_ready(&self) -> bool { self.ready }

    pub fn stderr_fd(&self) -> RawFd { self.stderr_read_fd }

    pub fn pid(&self) -> i32 { self.pid.unwrap_or(0) }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Classification {
    Debug,
    Warn,
    /// A fatal error line; carries the message to set on `last_error`.
    Error(String),
    /// The "valid display devices" hint; carries the suggested monitor name.
    ConfigHint(String),
}

const NONFATAL_ERROR_SUBSTRINGS: &[&str] = &["Failed to load module \"kbd\"", "No input driver matching"];

const BENIGN_WARNING_SUBSTRINGS: &[&str] = &[
    "trying again",
    "initial framebuffer",
    "looking for one",
    "EDID",
    "The directory \"",
    "couldn't open module kbd",
    "No input driver matching",
];

/// Pure classification of one already-trimmed line of Xorg stderr output.
pub fn classify_line(line: &str) -> Classification {
    if line.starts_with("(EE)") {
        if NONFATAL_ERROR_SUBSTRINGS.iter().any(|s| line.contains(s)) {
            return Classification::Debug;
        }
        return Classification::Error(format!("[XORG] {}", line));
    }

    if line.starts_with("(WW)") {
        if let Some(hint) = extract_valid_display_devices_hint(line) {
            return Classification::ConfigHint(hint);
        }
        if BENIGN_WARNING_SUBSTRINGS.iter().any(|s| line.contains(s)) {
            return Classification::Debug;
        }
        return Classification::Warn;
    }

    Classification::Debug
}

fn extract_valid_display_devices_hint(line: &str) -> Option<String> {
    if !line.contains("valid display devices are") {
        return None;
    }
    let after_quote = &line[line.find('\'')? + 1..];
    let end = after_quote.find(|c| c == '\'' || c == ',' || c == ' ')?;
    Some(after_quote[..end].to_owned())
}

/// Bounded accumulator for partial lines read off the stderr pipe, mirroring
/// the 512-byte buffer used for the Xorg diagnostic stream.
struct LineBuffer {
    data: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self { LineBuffer { data: Vec::with_capacity(LINE_BUFFER_SIZE) } }

    /// Appends `chunk`, returning completed lines. If the buffer fills without
    /// a newline, the entire buffer is flushed as a truncated line.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if self.data.len() >= LINE_BUFFER_SIZE {
                lines.push(String::from_utf8_lossy(&self.data).into_owned());
                self.data.clear();
            }
            if byte == b'\n' {
                lines.push(String::from_utf8_lossy(&self.data).into_owned());
                self.data.clear();
            } else {
                self.data.push(byte);
            }
        }
        lines
    }
}

/// Drains and classifies whatever is waiting on the display-server's stderr
/// pipe, applying the classifications to `ctx.last_error`. Closes the pipe on
/// EOF or a non-retryable error.
pub fn check_pipe(ctx: &mut ServiceContext) {
    if ctx.display.stderr_read_fd == SENTINEL {
        return;
    }

    let mut chunk = [0u8; LINE_BUFFER_SIZE];
    let read = unsafe {
        libc::read(ctx.display.stderr_read_fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
    };

    if read > 0 {
        let lines = ctx.display.buffer.feed(&chunk[..read as usize]);
        for line in lines {
            apply_classification(ctx, &line);
        }
        return;
    }

    if read == 0 {
        close_pipe(ctx);
        return;
    }

    let err = io::Error::last_os_error();
    if err.kind() != io::ErrorKind::WouldBlock && err.raw_os_error() != Some(libc::EINTR) {
        close_pipe(ctx);
    }
}

fn apply_classification(ctx: &mut ServiceContext, line: &str) {
    if line.is_empty() || (line.len() == 1 && line.chars().next().unwrap().is_whitespace()) {
        return;
    }
    match classify_line(line) {
        Classification::Debug => log::debug!("[XORG] {}", line),
        Classification::Warn => log::warn!("[XORG] {}", line),
        Classification::Error(message) => ctx.last_error.set(message),
        Classification::ConfigHint(monitor) => ctx.last_error.set(format!(
            "You need to change the ConnectedMonitor setting in {} to {}",
            ctx.config.x_conf_file, monitor
        )),
    }
}

fn close_pipe(ctx: &mut ServiceContext) {
    unsafe {
        if ctx.display.stderr_read_fd != SENTINEL {
            libc::close(ctx.display.stderr_read_fd);
        }
        if ctx.display.stderr_write_fd != SENTINEL {
            libc::close(ctx.display.stderr_write_fd);
        }
    }
    ctx.display.stderr_read_fd = SENTINEL;
    ctx.display.stderr_write_fd = SENTINEL;
}

/// Probes display readiness by attempting to connect to the local X11 socket
/// for `display_num` (e.g. `:8` -> `/tmp/.X11-unix/X8`), bounded to 10s
/// wall-clock while the child stays alive.
fn probe_ready(ctx: &ServiceContext, display_num: &str) -> bool {
    let number = display_num.trim_start_matches(':');
    let path = format!("/tmp/.X11-unix/X{}", number);
    let start = Instant::now();
    while start.elapsed() < PROBE_TIMEOUT {
        if !ctx.display.is_alive(&ctx.supervisor) {
            return false;
        }
        if UnixStream::connect(&path).is_ok() {
            return true;
        }
        std::thread::sleep(PROBE_RETRY_INTERVAL);
    }
    false
}

/// Transitions towards the "display ready" state. See SPEC_FULL.md §4.F.
pub fn start_secondary(ctx: &mut ServiceContext, need_display: bool) -> io::Result<()> {
    power::switch_on(ctx.backend.as_mut()).map_err(|e| {
        ctx.last_error.set(format!("failed to power on discrete card: {}", e));
        e
    })?;

    let bound = ctx.pci_bus.get_driver(ctx.discrete);
    let configured = ctx.config.driver.as_str();
    if let Some(bound) = &bound {
        if !bound.eq_ignore_ascii_case(configured) {
            if let Err(e) = crate::module::unload(bound) {
                ctx.last_error.set(e.to_string());
                return Err(io::Error::new(io::ErrorKind::Other, e));
            }
        }
    }

    let still_bound = ctx.pci_bus.get_driver(ctx.discrete);
    if still_bound.as_deref().map_or(true, |d| !d.eq_ignore_ascii_case(configured)) {
        if let Err(e) = crate::module::load(&ctx.config.driver_module, configured, &[]) {
            ctx.last_error.set(e.to_string());
            return Err(io::Error::new(io::ErrorKind::Other, e));
        }
    }

    if !need_display {
        ctx.last_error.reset();
        return Ok(());
    }

    if ctx.display.is_alive(&ctx.supervisor) {
        return Ok(());
    }

    let conf_path = xorg_path_with_driver(&ctx.config.x_conf_file, configured);
    let pci_arg = ctx.discrete.to_xorg_arg();

    let mut argv: Vec<String> = vec![
        ctx.config.x_display.clone(),
        "-config".into(),
        conf_path,
        "-sharevts".into(),
        "-nolisten".into(),
        "tcp".into(),
        "-noreset".into(),
        "-isolateDevice".into(),
        pci_arg,
    ];
    if !ctx.config.mod_path.is_empty() {
        argv.push("-modulepath".into());
        argv.push(ctx.config.mod_path.clone());
    }
    let mut argv_str = vec!["Xorg"];
    argv_str.extend(argv.iter().map(String::as_str));

    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        let err = io::Error::last_os_error();
        ctx.last_error.set(err.to_string());
        return Err(err);
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let pid = process::fork_detached(&mut ctx.supervisor, "Xorg", &argv_str, &ctx.config.ld_path, write_fd)?;
    ctx.display.pid = Some(pid);
    ctx.display.stderr_read_fd = read_fd;
    ctx.display.stderr_write_fd = write_fd;
    ctx.display.ready = false;

    if probe_ready(ctx, &ctx.config.x_display.clone()) {
        ctx.last_error.reset();
        ctx.display.ready = true;
        Ok(())
    } else if ctx.display.is_alive(&ctx.supervisor) {
        ctx.supervisor.stop_wait(pid, crate::signals::is_fast_shutdown());
        ctx.last_error.set("X did not start properly: unresponsive");
        Err(io::Error::new(io::ErrorKind::TimedOut, "display server unresponsive"))
    } else {
        ctx.last_error.set("X did not start properly");
        Err(io::Error::new(io::ErrorKind::Other, "display server exited before becoming ready"))
    }
}

/// Tears down the secondary display stack. See SPEC_FULL.md §4.F.
pub fn stop_secondary(ctx: &mut ServiceContext, shutdown: bool) {
    if let Some(pid) = ctx.display.pid {
        if ctx.supervisor.is_running(pid) {
            ctx.supervisor.stop_wait(pid, crate::signals::is_fast_shutdown());
        }
        close_pipe(ctx);
        ctx.display.pid = None;
        ctx.display.ready = false;
    }

    if matches!(ctx.config.pm_method(), crate::config::PmMethod::Disabled) && !shutdown {
        return;
    }

    if ctx.backend.requires_driver_unload() {
        if ctx.backend.status() != power::SwitchState::On {
            return;
        }
        if let Some(driver) = ctx.pci_bus.get_driver(ctx.discrete) {
            if crate::module::unload(&driver).is_err() {
                log::warn!("refusing to power off while driver '{}' is still bound", driver);
                return;
            }
        }
    }

    if let Err(e) = power::switch_off(ctx.backend.as_mut()) {
        ctx.last_error.set(e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_driver_placeholder() {
        assert_eq!(xorg_path_with_driver("/etc/bumbled/xorg.conf.DRIVER", "nvidia"), "/etc/bumbled/xorg.conf.nvidia");
    }

    #[test]
    fn classifies_fatal_error_line() {
        match classify_line("(EE) NVIDIA: Failed to initialize the NVIDIA kernel module") {
            Classification::Error(message) => assert!(message.starts_with("[XORG] (EE)")),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn demotes_known_nonfatal_error() {
        assert_eq!(classify_line("(EE) Failed to load module \"kbd\" (module does not exist, 0)"), Classification::Debug);
    }

    #[test]
    fn demotes_known_benign_warning() {
        assert_eq!(classify_line("(WW) NVIDIA(0): EDID read failed"), Classification::Debug);
    }

    #[test]
    fn extracts_valid_display_devices_hint() {
        let line = "(WW) NVIDIA(0): the valid display devices are 'CRT-0', 'DFP-0'";
        match classify_line(line) {
            Classification::ConfigHint(monitor) => assert_eq!(monitor, "CRT-0"),
            other => panic!("expected ConfigHint, got {:?}", other),
        }
    }

    #[test]
    fn buffer_flushes_full_line_without_newline() {
        let mut buffer = LineBuffer::new();
        let chunk = vec![b'x'; LINE_BUFFER_SIZE];
        let lines = buffer.feed(&chunk);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), LINE_BUFFER_SIZE);
    }

    #[test]
    fn buffer_splits_on_newline() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.feed(b"first\nsecond");
        assert_eq!(lines, vec!["first".to_owned()]);
        let more = buffer.feed(b"\n");
        assert_eq!(more, vec!["second".to_owned()]);
    }
}
