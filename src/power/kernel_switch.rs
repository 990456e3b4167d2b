// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Kernel-switch backend (`vga_switcheroo` debugfs interface).

use super::{PowerBackend, SwitchInfo, SwitchState};
use std::{fs, io};

const SWITCHEROO_PATH: &str = "/sys/kernel/debug/vgaswitcheroo/switch";

pub struct KernelSwitch;

impl KernelSwitch {
    pub fn new() -> Self { KernelSwitch }
}

pub fn is_available(info: &SwitchInfo) -> bool {
    info.pm_method == "switcheroo" && info.driver == "nouveau"
}

fn write_command(msg: &str) -> io::Result<()> { fs::write(SWITCHEROO_PATH, msg) }

impl PowerBackend for KernelSwitch {
    fn name(&self) -> &'static str { "switcheroo" }

    fn requires_driver_unload(&self) -> bool { true }

    fn status(&self) -> SwitchState {
        let text = match fs::read_to_string(SWITCHEROO_PATH) {
            Ok(t) => t,
            Err(_) => return SwitchState::Unavailable,
        };
        // lines look like "0:DIS: :Pwr:0000:01:00.0\n"; find the discrete
        // entry and inspect the power character just past "0:DIS: :".
        for line in text.lines() {
            if line.len() > 2 && &line[2..5] == "DIS" {
                return match line.as_bytes().get(8) {
                    Some(b'P') => SwitchState::On,
                    Some(b'O') => SwitchState::Off,
                    _ => SwitchState::Unavailable,
                };
            }
        }
        SwitchState::Unavailable
    }

    fn on(&mut self) -> io::Result<()> { write_command("ON\n") }

    fn off(&mut self) -> io::Result<()> { write_command("OFF\n") }
}
