// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Local-filesystem IPC server (component G). A single listening socket,
//! bound exclusively at startup and removed at shutdown; text messages
//! terminated by a NUL byte, fitting in a fixed 1024-byte buffer.
//!
//! Built directly on `libc` rather than `std::os::unix::net` because the
//! protocol needs a backlog of exactly 100, a `chmod` on the node, and
//! non-blocking accept/read/write, none of which `UnixListener` exposes.

use std::{
    ffi::CString,
    io, mem,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// `sizeof(sockaddr_un.sun_path)` on Linux is 108 bytes including the NUL
/// terminator, leaving 107 usable bytes for the path itself.
pub const SOCKET_PATH_MAX: usize = 107;
const BACKLOG: i32 = 100;
pub const MAX_MESSAGE: usize = 1024;
const SENTINEL: RawFd = -1;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("failed to create socket: {0}")]
    Create(io::Error),
    #[error("another instance is already listening on {0:?}")]
    AlreadyRunning(PathBuf),
    #[error("failed to probe stale socket {0:?}: {1}")]
    Probe(PathBuf, io::Error),
    #[error("failed to unlink stale socket {0:?}: {1}")]
    Unlink(PathBuf, io::Error),
    #[error("failed to bind socket {0:?}: {1}")]
    Bind(PathBuf, io::Error),
    #[error("failed to listen on socket {0:?}: {1}")]
    Listen(PathBuf, io::Error),
    #[error("failed to chmod socket {0:?}: {1}")]
    Chmod(PathBuf, io::Error),
}

/// Truncates `path` to [`SOCKET_PATH_MAX`] bytes, matching the historical
/// `sockaddr_un` footgun this protocol inherits.
pub fn truncate_path(path: &str) -> String {
    if path.len() <= SOCKET_PATH_MAX {
        path.to_owned()
    } else {
        path.as_bytes()[..SOCKET_PATH_MAX].iter().map(|&b| b as char).collect()
    }
}

fn sockaddr_for(path: &str) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    let len = bytes.len().min(addr.sun_path.len() - 1);
    for (dst, &src) in addr.sun_path.iter_mut().zip(bytes[..len].iter()) {
        *dst = src as libc::c_char;
    }
    let socklen = (mem::size_of::<libc::sa_family_t>() + len + 1) as libc::socklen_t;
    (addr, socklen)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Probes `path` with a connect attempt. `Ok(true)` means a live instance is
/// already listening there; `Ok(false)` means the node is stale or absent
/// and safe to unlink (resolves SPEC_FULL.md §9 Open Question ii).
fn another_instance_is_live(path: &str) -> io::Result<bool> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let (addr, len) = sockaddr_for(path);
    let ret = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
    unsafe {
        libc::close(fd);
    }
    if ret == 0 {
        return Ok(true);
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::ECONNREFUSED) | Some(libc::ENOENT) => Ok(false),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Binds and listens on a fresh socket at `path`. Refuses to start if an
/// existing node answers a connect attempt; otherwise unlinks it first.
pub fn bind_listener(path: &Path) -> Result<RawFd, IpcError> {
    let path_str = truncate_path(&path.to_string_lossy());
    let path_buf = PathBuf::from(&path_str);

    if Path::new(&path_str).exists() {
        match another_instance_is_live(&path_str) {
            Ok(true) => return Err(IpcError::AlreadyRunning(path_buf)),
            Ok(false) => {
                std::fs::remove_file(&path_str).map_err(|e| IpcError::Unlink(path_buf.clone(), e))?;
            }
            Err(e) => return Err(IpcError::Probe(path_buf, e)),
        }
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(IpcError::Create(io::Error::last_os_error()));
    }

    let (addr, len) = sockaddr_for(&path_str);
    if unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) } != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(IpcError::Bind(path_buf, err));
    }

    if unsafe { libc::listen(fd, BACKLOG) } != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(IpcError::Listen(path_buf, err));
    }

    if let Err(e) = set_nonblocking(fd) {
        unsafe {
            libc::close(fd);
        }
        return Err(IpcError::Bind(path_buf, e));
    }

    let c_path = CString::new(path_str.as_str()).unwrap();
    if unsafe { libc::chmod(c_path.as_ptr(), 0o660) } != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(IpcError::Chmod(path_buf, err));
    }

    Ok(fd)
}

/// Non-blocking accept. Returns `Ok(None)` when nothing is waiting.
pub fn accept(listen_fd: RawFd) -> io::Result<Option<RawFd>> {
    let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if fd >= 0 {
        set_nonblocking(fd)?;
        return Ok(Some(fd));
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(None),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Outcome of one non-blocking read attempt on a client fd.
pub enum ReadOutcome {
    WouldBlock,
    Closed,
    Data(Vec<u8>),
}

pub fn read_chunk(fd: RawFd) -> io::Result<ReadOutcome> {
    let mut buf = [0u8; MAX_MESSAGE];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        return Ok(ReadOutcome::Data(buf[..n as usize].to_vec()));
    }
    if n == 0 {
        return Ok(ReadOutcome::Closed);
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EWOULDBLOCK) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(ReadOutcome::WouldBlock),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Writes `message` followed by a NUL terminator, matching the wire framing.
pub fn send_message(fd: RawFd, message: &str) -> io::Result<()> {
    let mut bytes = message.as_bytes().to_vec();
    bytes.push(0);
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Half-closes then closes `fd`, matching the historical `socketClose`
/// behavior. Idempotent on an already-sentinel fd.
pub fn close(fd: RawFd) -> RawFd {
    if fd != SENTINEL {
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
            libc::close(fd);
        }
    }
    SENTINEL
}

pub fn close_listener(fd: RawFd, path: &Path) -> RawFd {
    let fd = close(fd);
    let _ = std::fs::remove_file(path);
    fd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_overlong_paths() {
        let long = "a".repeat(SOCKET_PATH_MAX + 20);
        assert_eq!(truncate_path(&long).len(), SOCKET_PATH_MAX);
    }

    #[test]
    fn leaves_short_paths_untouched() {
        assert_eq!(truncate_path("/var/run/bumbled.socket"), "/var/run/bumbled.socket");
    }

    #[test]
    fn absent_socket_is_not_a_live_instance() {
        assert!(!another_instance_is_live("/tmp/bumbled-test-nonexistent.socket").unwrap());
    }
}
