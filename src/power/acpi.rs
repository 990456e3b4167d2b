// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! ACPI-toggle backend (`bbswitch`-style procfs interface).

use super::{PowerBackend, SwitchInfo, SwitchState};
use crate::module;
use std::{fs, io};

const BBSWITCH_PATH: &str = "/proc/acpi/bbswitch";

pub struct AcpiToggle;

impl AcpiToggle {
    pub fn new() -> Self { AcpiToggle }
}

/// Whether `BBSWITCH_PATH` exists and is both readable and writable: `status()`
/// reads it and `on()`/`off()` write to it, so a read-only node (e.g. wrong
/// permissions, or mounted `ro`) must not be reported available.
fn node_is_read_write(path: &str) -> bool { fs::OpenOptions::new().read(true).write(true).open(path).is_ok() }

pub fn is_available(_info: &SwitchInfo) -> bool {
    if node_is_read_write(BBSWITCH_PATH) {
        log::debug!("bbswitch has been detected.");
        return true;
    }
    // the module may not be loaded yet; try loading it on demand.
    if module::load("bbswitch", "bbswitch", &[]).is_ok() && node_is_read_write(BBSWITCH_PATH) {
        log::debug!("successfully loaded bbswitch");
        return true;
    }
    log::debug!("bbswitch is not available, perhaps you need to insmod it?");
    false
}

fn write_command(msg: &str) -> io::Result<()> { fs::write(BBSWITCH_PATH, msg) }

impl PowerBackend for AcpiToggle {
    fn name(&self) -> &'static str { "bbswitch" }

    fn requires_driver_unload(&self) -> bool { true }

    fn status(&self) -> SwitchState {
        // the entry reads "0000:00:00.0 ON\n" or "0000:00:00.0 OFF\n";
        // skip the fixed-width bus id prefix and inspect the next byte.
        let text = match fs::read(BBSWITCH_PATH) {
            Ok(t) => t,
            Err(_) => return SwitchState::Unavailable,
        };
        match text.get(14) {
            Some(b'N') => SwitchState::On,
            Some(b'F') => SwitchState::Off,
            _ => SwitchState::Unavailable,
        }
    }

    fn on(&mut self) -> io::Result<()> { write_command("ON\n") }

    fn off(&mut self) -> io::Result<()> { write_command("OFF\n") }
}
