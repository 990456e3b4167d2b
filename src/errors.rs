// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! The first-error-wins `last_error` store (component L) shared by the
//! control loop and every client `S` status query. Module-specific failures
//! (startup, module load, protocol) carry their own `thiserror` enums next
//! to the code that raises them; this store only ever holds the rendered
//! message of whichever one fires first.

use std::sync::Mutex;

/// First-error-wins store. Only the first `set()` since the last `reset()`
/// sticks; every later call is only logged. This is the one piece of process
/// state touched from both the control loop and every `S` status reply.
#[derive(Default)]
pub struct LastError {
    message: Mutex<Option<String>>,
}

impl LastError {
    pub fn new() -> Self { LastError::default() }

    /// Records `message` as the error, unless one is already stored.
    pub fn set(&self, message: impl Into<String>) {
        let message = message.into();
        let mut guard = self.message.lock().unwrap();
        if guard.is_none() {
            log::error!("{}", message);
            *guard = Some(message);
        } else {
            log::error!("{} (superseded by earlier error)", message);
        }
    }

    /// Clears any stored error. The only other way to clear it is a
    /// successful `start_secondary`.
    pub fn reset(&self) { *self.message.lock().unwrap() = None; }

    pub fn get(&self) -> Option<String> { self.message.lock().unwrap().clone() }

    pub fn is_set(&self) -> bool { self.message.lock().unwrap().is_some() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let last_error = LastError::new();
        last_error.set("a");
        last_error.set("b");
        assert_eq!(last_error.get().as_deref(), Some("a"));
    }

    #[test]
    fn reset_allows_a_new_first_error() {
        let last_error = LastError::new();
        last_error.set("a");
        last_error.reset();
        last_error.set("b");
        assert_eq!(last_error.get().as_deref(), Some("b"));
    }
}
