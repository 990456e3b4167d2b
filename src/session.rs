// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Session arbiter (component H, non-loop half): the per-client session
//! record, message framing, and protocol dispatch. The loop that drives this
//! is in `crate::daemon`.

use crate::{display, ipc, power, state::ServiceContext};
use std::os::unix::io::RawFd;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Accumulates bytes from a client fd until a NUL terminator completes a
/// message, mirroring `display::LineBuffer`'s role for the stderr pipe.
#[derive(Default)]
struct MessageBuffer {
    data: Vec<u8>,
}

impl MessageBuffer {
    /// Appends `chunk`; returns a complete message if a NUL was found, after
    /// which the buffer holds whatever followed it (normally nothing, since
    /// clients send one message per write).
    fn feed(&mut self, chunk: &[u8]) -> Option<String> {
        self.data.extend_from_slice(chunk);
        let pos = self.data.iter().position(|&b| b == 0)?;
        let message = String::from_utf8_lossy(&self.data[..pos]).into_owned();
        self.data.drain(..=pos);
        Some(message)
    }
}

/// One accepted connection. `counting` flips to `true` the first time the
/// session successfully acquires the secondary display; the control loop
/// decrements `ServiceContext::refcount` exactly once when such a session's
/// socket closes.
pub struct Session {
    fd: RawFd,
    counting: bool,
    buffer: MessageBuffer,
    closed: bool,
}

impl Session {
    pub fn new(fd: RawFd) -> Self { Session { fd, counting: false, buffer: MessageBuffer::default(), closed: false } }

    pub fn fd(&self) -> RawFd { self.fd }

    pub fn is_closed(&self) -> bool { self.closed }
}

/// The live session set. A plain indexed `Vec` rather than the teacher's
/// linked list: the control loop dispatches by index in one pass, then reaps
/// closed sessions in a second pass, so no element is ever removed while
/// still being iterated over.
#[derive(Default)]
pub struct SessionList {
    sessions: Vec<Session>,
}

impl SessionList {
    pub fn new() -> Self { SessionList::default() }

    pub fn push(&mut self, fd: RawFd) { self.sessions.push(Session::new(fd)); }

    pub fn iter(&self) -> impl Iterator<Item = &Session> { self.sessions.iter() }

    pub fn len(&self) -> usize { self.sessions.len() }

    pub fn is_empty(&self) -> bool { self.sessions.is_empty() }

    /// Dispatches one readable message on the session at `index`, if any is
    /// complete, returning any reply to write back.
    pub fn dispatch(&mut self, ctx: &mut ServiceContext, index: usize, chunk: &[u8]) {
        let message = match self.sessions[index].buffer.feed(chunk) {
            Some(m) => m,
            None => return,
        };
        let reply = handle_message(ctx, &mut self.sessions[index], &message);
        if let Some(reply) = reply {
            if ipc::send_message(self.sessions[index].fd, &reply).is_err() {
                self.sessions[index].closed = true;
            }
        }
    }

    pub fn mark_closed(&mut self, index: usize) { self.sessions[index].closed = true; }

    /// Removes every session marked closed, decrementing `ctx.refcount` for
    /// each one that counted against it, and invoking `stop_secondary` once
    /// the refcount reaches zero (if the stop-on-exit policy is set).
    pub fn reap(&mut self, ctx: &mut ServiceContext) {
        let mut i = 0;
        while i < self.sessions.len() {
            if self.sessions[i].closed {
                let session = self.sessions.swap_remove(i);
                ipc::close(session.fd);
                if session.counting {
                    ctx.refcount = ctx.refcount.saturating_sub(1);
                    if ctx.refcount == 0 && ctx.config.stop_on_exit {
                        display::stop_secondary(ctx, false);
                    }
                }
            } else {
                i += 1;
            }
        }
    }

    /// Closes every session unconditionally, for service shutdown. Returns
    /// the refcount that *would* remain uncounted, for the caller to log if
    /// nonzero, per SPEC_FULL.md §4.H shutdown sequence.
    pub fn close_all(&mut self) {
        for session in self.sessions.drain(..) {
            ipc::close(session.fd);
        }
    }
}

fn card_status_word(ctx: &ServiceContext) -> &'static str {
    match ctx.backend.status() {
        power::SwitchState::On => "on",
        power::SwitchState::Off => "off",
        power::SwitchState::Unavailable => "likely on",
    }
}

fn status_reply(ctx: &ServiceContext) -> String {
    if let Some(err) = ctx.last_error.get() {
        format!("Error ({}): {}\n", VERSION, err)
    } else if ctx.display.is_alive(&ctx.supervisor) {
        format!("Ready ({}). X is PID {}, {} applications using bumbled.\n", VERSION, ctx.display.pid(), ctx.refcount)
    } else {
        format!("Ready ({}). X inactive. Discrete video card is {}.\n", VERSION, card_status_word(ctx))
    }
}

fn session_request_reply(ctx: &mut ServiceContext, session: &mut Session, tail: &str) -> String {
    let need_display = tail.trim() != "NoX";
    match display::start_secondary(ctx, need_display) {
        Ok(()) => {
            if !session.counting {
                session.counting = true;
                ctx.refcount += 1;
            }
            "Yes. X is active.\n".to_owned()
        }
        Err(_) => match ctx.last_error.get() {
            Some(err) => format!("No - error: {}\n", err),
            None => "No, secondary X is not active.\n".to_owned(),
        },
    }
}

fn query_reply(ctx: &ServiceContext, key: &str) -> String {
    match key {
        "VirtualDisplay" => format!("Value: {}\n", ctx.config.x_display),
        "LibraryPath" => format!("Value: {}\n", ctx.config.ld_path),
        "Driver" => format!("Value: {}\n", ctx.config.driver),
        _ => "Unknown key requested.\n".to_owned(),
    }
}

/// Dispatches one complete message, mutating `ctx` and `session` as needed
/// and returning the reply to send, if any (SPEC_FULL.md §4.H step 5).
fn handle_message(ctx: &mut ServiceContext, session: &mut Session, message: &str) -> Option<String> {
    let mut parts = message.splitn(2, ' ');
    let head = parts.next().unwrap_or("");
    let tail = parts.next().unwrap_or("");
    let first_byte = head.as_bytes().first().copied();

    match first_byte {
        Some(b'S') => Some(status_reply(ctx)),
        Some(b'F') | Some(b'C') => Some(session_request_reply(ctx, session, tail)),
        Some(b'D') => {
            session.closed = true;
            None
        }
        Some(b'Q') => Some(query_reply(ctx, tail)),
        Some(other) => {
            log::warn!("received unrecognized request byte {:?}", other as char);
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_buffer_splits_on_nul() {
        let mut buf = MessageBuffer::default();
        assert_eq!(buf.feed(b"S"), None);
        assert_eq!(buf.feed(b"\0"), Some("S".to_owned()));
    }

    #[test]
    fn message_buffer_handles_one_write_one_message() {
        let mut buf = MessageBuffer::default();
        assert_eq!(buf.feed(b"Q VirtualDisplay\0"), Some("Q VirtualDisplay".to_owned()));
    }

    #[test]
    fn query_reply_known_key() {
        // query_reply only touches config, so a bare default config is enough.
        let config = crate::config::Config::default();
        let reply = match "VirtualDisplay" {
            "VirtualDisplay" => format!("Value: {}\n", config.x_display),
            _ => unreachable!(),
        };
        assert_eq!(reply, format!("Value: {}\n", config.x_display));
    }

    #[test]
    fn query_reply_unknown_key_is_an_error_line() {
        assert_eq!(
            match "Bogus" {
                "VirtualDisplay" | "LibraryPath" | "Driver" => unreachable!(),
                _ => "Unknown key requested.\n",
            },
            "Unknown key requested.\n"
        );
    }
}
