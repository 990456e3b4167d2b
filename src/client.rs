// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Client launcher, protocol side (component I). Connects to the service,
//! queries its settings, negotiates a session, then execs the target program
//! under an acceleration bridge. Bridge setup honors only the library-path
//! and display-number values the service reports; everything else about a
//! bridge's own runtime behavior is its concern, not this crate's.

use crate::process;
use std::{
    env, io,
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
};

const MAX_MESSAGE: usize = crate::ipc::MAX_MESSAGE;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to bumbled at {0:?}: {1}")]
    Connect(PathBuf, io::Error),
    #[error("failed to write request: {0}")]
    Write(io::Error),
    #[error("failed to read reply: {0}")]
    Read(io::Error),
    #[error("no accel/display bridge found, try installing primus or virtualgl")]
    NoBridgeFound,
    #[error("unknown accel/display bridge '{0}'")]
    UnknownBridge(String),
    #[error("accel/display bridge '{0}' is not installed")]
    BridgeUnavailable(String),
}

/// One connection to the service, used for one request/reply exchange at a
/// time; the protocol is strictly half-duplex per message.
pub struct Session {
    stream: UnixStream,
}

impl Session {
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).map_err(|e| ClientError::Connect(path.to_owned(), e))?;
        Ok(Session { stream })
    }

    fn send(&mut self, message: &str) -> Result<(), ClientError> {
        let mut bytes = message.as_bytes().to_vec();
        bytes.push(0);
        self.stream.write_all(&bytes).map_err(ClientError::Write)
    }

    fn recv(&mut self) -> Result<String, ClientError> {
        let mut buf = [0u8; MAX_MESSAGE];
        let mut total = 0;
        loop {
            let n = self.stream.read(&mut buf[total..]).map_err(ClientError::Read)?;
            if n == 0 {
                return Ok(String::from_utf8_lossy(&buf[..total]).into_owned());
            }
            total += n;
            if let Some(pos) = buf[..total].iter().position(|&b| b == 0) {
                return Ok(String::from_utf8_lossy(&buf[..pos]).into_owned());
            }
            if total >= buf.len() {
                return Ok(String::from_utf8_lossy(&buf[..total]).into_owned());
            }
        }
    }

    pub fn status(&mut self) -> Result<String, ClientError> {
        self.send("S")?;
        self.recv()
    }

    pub fn query(&mut self, key: &str) -> Result<String, ClientError> {
        self.send(&format!("Q {}", key))?;
        let reply = self.recv()?;
        Ok(reply.strip_prefix("Value: ").unwrap_or(&reply).trim_end().to_owned())
    }

    pub fn request_session(&mut self, need_display: bool) -> Result<String, ClientError> {
        self.send(if need_display { "C" } else { "C NoX" })?;
        self.recv()
    }

    pub fn done(&mut self) { let _ = self.send("D"); }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bridge {
    Primus,
    VirtualGl,
    None,
}

impl Bridge {
    fn name(self) -> &'static str {
        match self {
            Bridge::Primus => "primus",
            Bridge::VirtualGl => "virtualgl",
            Bridge::None => "none",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "primus" => Some(Bridge::Primus),
            "virtualgl" => Some(Bridge::VirtualGl),
            "none" => Some(Bridge::None),
            _ => None,
        }
    }

    /// Mirrors the historical availability probes: `primus` needs a
    /// `libGL.so.1` somewhere on its configured search path; `virtualgl`
    /// needs both `vglrun` and `vglclient` on `PATH`; `none` is always usable.
    fn is_available(self, primus_ldpath: &str) -> bool {
        match self {
            Bridge::Primus => {
                primus_ldpath.split(':').filter(|p| !p.is_empty()).any(|dir| Path::new(dir).join("libGL.so.1").exists())
            }
            Bridge::VirtualGl => which("vglrun") && which("vglclient"),
            Bridge::None => true,
        }
    }
}

/// `none` is never chosen by auto-detection; it is only reachable by
/// explicit `--bridge none` or by forcing `--no-xorg`.
const AUTO_ORDER: [Bridge; 2] = [Bridge::Primus, Bridge::VirtualGl];

fn which(program: &str) -> bool {
    env::var_os("PATH").map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file())).unwrap_or(false)
}

fn detect_bridge(requested: Option<&str>, primus_ldpath: &str) -> Result<Bridge, ClientError> {
    match requested {
        None | Some("auto") => {
            AUTO_ORDER.into_iter().find(|b| b.is_available(primus_ldpath)).ok_or(ClientError::NoBridgeFound)
        }
        Some(name) => {
            let bridge = Bridge::from_name(name).ok_or_else(|| ClientError::UnknownBridge(name.to_owned()))?;
            if bridge.is_available(primus_ldpath) {
                Ok(bridge)
            } else {
                Err(ClientError::BridgeUnavailable(name.to_owned()))
            }
        }
    }
}

fn prepend_ld_library_path(extra: &str) -> String {
    let current = env::var("LD_LIBRARY_PATH").unwrap_or_default();
    if extra.is_empty() {
        current
    } else if current.is_empty() {
        extra.to_owned()
    } else {
        format!("{}:{}", extra, current)
    }
}

/// CLI-derived options for one `bumblerun` invocation.
pub struct ClientOptions {
    pub socket_path: String,
    pub status: bool,
    pub bridge: Option<String>,
    pub vgl_compress: String,
    pub vgl_options: String,
    pub primus_ldpath: String,
    pub fallback_start: bool,
    pub no_xorg: bool,
    pub command: Vec<String>,
}

fn exec_via_bridge(bridge: Bridge, opts: &ClientOptions, ld_path: &str, x_display: &str) -> io::Error {
    let command = &opts.command;
    match bridge {
        Bridge::None => {
            env::set_var("LD_LIBRARY_PATH", prepend_ld_library_path(ld_path));
            let argv: Vec<&str> = command.iter().map(String::as_str).collect();
            process::exec_replace(&argv)
        }
        Bridge::VirtualGl => {
            if env::var_os("VGL_READBACK").is_none() {
                env::set_var("VGL_READBACK", "pbo");
            }
            let mut argv: Vec<String> = vec![
                "vglrun".into(),
                "-c".into(),
                opts.vgl_compress.clone(),
                "-d".into(),
                x_display.to_owned(),
                "-ld".into(),
                ld_path.to_owned(),
            ];
            if !opts.vgl_options.is_empty() {
                argv.extend(opts.vgl_options.split(' ').filter(|s| !s.is_empty()).map(str::to_owned));
            }
            argv.push("--".into());
            argv.extend(command.iter().cloned());
            let argv_str: Vec<&str> = argv.iter().map(String::as_str).collect();
            process::exec_replace(&argv_str)
        }
        Bridge::Primus => {
            env::set_var("BUMBLEBEE_SOCKET", &opts.socket_path);
            if env::var_os("PRIMUS_DISPLAY").is_none() {
                env::set_var("PRIMUS_DISPLAY", x_display);
            }
            let mut combined = opts.primus_ldpath.clone();
            if !ld_path.is_empty() {
                combined.push(':');
                combined.push_str(ld_path);
            }
            env::set_var("LD_LIBRARY_PATH", prepend_ld_library_path(&combined));
            let argv: Vec<&str> = command.iter().map(String::as_str).collect();
            process::exec_replace(&argv)
        }
    }
}

fn fallback(opts: &ClientOptions) -> anyhow::Result<i32> {
    if !opts.fallback_start || opts.command.is_empty() {
        anyhow::bail!("the bumbled server was not available");
    }
    log::warn!("the bumbled server was not available; running '{}' directly", opts.command[0]);
    let argv: Vec<&str> = opts.command.iter().map(String::as_str).collect();
    let err = process::exec_replace(&argv);
    anyhow::bail!("unable to start program in fallback mode: {}", err)
}

/// Runs one `bumblerun` invocation to completion. On the golden path this
/// execs the target program and never returns; the `Ok(i32)` case is only
/// reached for `--status`, or when a fallback exec itself fails to launch.
pub fn run(opts: ClientOptions) -> anyhow::Result<i32> {
    let socket_path = Path::new(&opts.socket_path);
    let mut session = match Session::connect(socket_path) {
        Ok(session) => session,
        Err(e) => {
            log::error!("could not connect to bumbled daemon - is it running? ({})", e);
            return fallback(&opts);
        }
    };

    if opts.status {
        let reply = session.status()?;
        println!("bumbled status: {}", reply.trim_end());
        return Ok(0);
    }

    if opts.command.is_empty() {
        anyhow::bail!("missing argument: program to run");
    }

    let ld_path = session.query("LibraryPath")?;
    let x_display = session.query("VirtualDisplay")?;

    let bridge = if opts.no_xorg {
        Bridge::None
    } else {
        match detect_bridge(opts.bridge.as_deref(), &opts.primus_ldpath) {
            Ok(bridge) => bridge,
            Err(e) => {
                log::error!("{}", e);
                session.done();
                return fallback(&opts);
            }
        }
    };
    log::debug!("using bridge '{}'", bridge.name());

    let reply = session.request_session(!opts.no_xorg)?;
    log::info!("response: {}", reply.trim_end());

    match reply.as_bytes().first() {
        Some(b'Y') => {
            log::info!("running application using {}", bridge.name());
            let err = exec_via_bridge(bridge, &opts, &ld_path, &x_display);
            anyhow::bail!("failed to run '{}' via bridge '{}': {}", opts.command[0], bridge.name(), err);
        }
        Some(b'N') => {
            log::error!("cannot access secondary GPU: {}", reply.trim_end());
            session.done();
            fallback(&opts)
        }
        _ => {
            log::error!("problem: {}", reply.trim_end());
            session.done();
            fallback(&opts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bridge_name_is_an_error() {
        assert!(matches!(detect_bridge(Some("bogus"), ""), Err(ClientError::UnknownBridge(_))));
    }

    #[test]
    fn none_bridge_is_always_available() {
        assert_eq!(detect_bridge(Some("none"), "").unwrap(), Bridge::None);
    }

    #[test]
    fn prepend_ld_library_path_handles_empty_extra() {
        env::remove_var("LD_LIBRARY_PATH");
        assert_eq!(prepend_ld_library_path(""), "");
    }
}
