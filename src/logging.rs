// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Logging setup (component K): `fern` + `log` to stderr by default, or to
//! syslog via raw `libc` calls when `--use-syslog` is set (service daemons
//! commonly run detached from a terminal, where stderr goes nowhere useful).

use fern::{Dispatch, InitError};
use log::LevelFilter;
use once_cell::sync::Lazy;
use std::{
    ffi::CString,
    io::{self, Write},
};

static SYSLOG_IDENT: Lazy<CString> = Lazy::new(|| CString::new(env!("CARGO_PKG_NAME")).unwrap());

pub fn setup(filter: LevelFilter, use_syslog: bool) -> Result<(), InitError> {
    let dispatch = Dispatch::new()
        // Exclude logs from crates we depend on.
        .level(LevelFilter::Off)
        // Include only the logs for this binary.
        .level_for(env!("CARGO_PKG_NAME"), filter)
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)));

    let dispatch = if use_syslog {
        unsafe { libc::openlog(SYSLOG_IDENT.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
        dispatch.chain(Box::new(SyslogWriter) as Box<dyn Write + Send>)
    } else {
        dispatch.chain(io::stderr())
    };

    dispatch.apply()?;
    Ok(())
}

/// A `fern`/`io::Write` sink that forwards each formatted line to syslog.
/// The bracketed level prefix baked in by the shared format string doubles
/// as the syslog priority selector, since `fern` does not hand a `Write`
/// sink the originating `log::Record`.
struct SyslogWriter;

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(text) = std::str::from_utf8(buf) {
            let line = text.trim_end_matches('\n');
            if !line.is_empty() {
                if let Ok(message) = CString::new(line) {
                    unsafe {
                        libc::syslog(priority_for(line), b"%s\0".as_ptr() as *const libc::c_char, message.as_ptr());
                    }
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

fn priority_for(line: &str) -> libc::c_int {
    if line.starts_with("[ERROR]") {
        libc::LOG_ERR
    } else if line.starts_with("[WARN]") {
        libc::LOG_WARNING
    } else if line.starts_with("[INFO]") {
        libc::LOG_INFO
    } else {
        libc::LOG_DEBUG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping_matches_level_prefix() {
        assert_eq!(priority_for("[ERROR] oops"), libc::LOG_ERR);
        assert_eq!(priority_for("[WARN] hmm"), libc::LOG_WARNING);
        assert_eq!(priority_for("[INFO] ok"), libc::LOG_INFO);
        assert_eq!(priority_for("[DEBUG] detail"), libc::LOG_DEBUG);
    }
}
