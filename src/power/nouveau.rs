// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Nouveau-trick backend: powers the card off by loading `nouveau` with
//! runtime power management enabled and holding an exclusive advisory lock on
//! its DRM node; powers on by releasing the lock and unloading the module.

use super::{PowerBackend, SwitchInfo, SwitchState};
use crate::module;
use std::{
    fs, io,
    os::unix::io::{AsRawFd, RawFd},
    thread,
    time::Duration,
};

const OPEN_RETRIES: u32 = 10;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(5);

pub struct NouveauTrick {
    lock: Option<fs::File>,
}

impl NouveauTrick {
    pub fn new() -> Self { NouveauTrick { lock: None } }
}

pub fn is_available(info: &SwitchInfo) -> bool {
    info.pm_method == "nouveau" && module::is_available("nouveau")
}

/// Finds the DRM card directory bound to the `nouveau` driver. If more than
/// one card matches, the last one found wins, mirroring the original
/// enumeration order.
fn find_nouveau_card() -> Option<u32> {
    let mut found = None;
    let entries = fs::read_dir("/sys/class/drm").ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // skip "cardN-HDMI-1"-style connector entries, keep bare "cardN"
        let suffix = match name.strip_prefix("card") {
            Some(s) => s,
            None => continue,
        };
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let number: u32 = suffix.parse().ok()?;
        let driver_link = entry.path().join("device/driver");
        if let Ok(target) = fs::read_link(&driver_link) {
            if target.file_name().and_then(|n| n.to_str()) == Some("nouveau") {
                found = Some(number);
            }
        }
    }
    found
}

fn open_with_retries(card: u32) -> io::Result<fs::File> {
    let path = format!("/dev/dri/card{}", card);
    let mut last_err = None;
    for attempt in 0..OPEN_RETRIES {
        match fs::OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < OPEN_RETRIES {
                    thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no nouveau DRM node found")))
}

fn flock_exclusive(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl PowerBackend for NouveauTrick {
    fn name(&self) -> &'static str { "nouveau" }

    fn requires_driver_unload(&self) -> bool { false }

    fn status(&self) -> SwitchState {
        if self.lock.is_some() {
            SwitchState::Off
        } else {
            SwitchState::On
        }
    }

    /// Powers the card ON: release the lock and unload the module.
    fn on(&mut self) -> io::Result<()> {
        self.lock = None;
        module::unload("nouveau")
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    /// Powers the card OFF: load the module with runtime PM enabled and hold
    /// an exclusive lock on its DRM node.
    fn off(&mut self) -> io::Result<()> {
        module::load("nouveau", "nouveau", &["runpm=1", "modeset=2"])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let card = find_nouveau_card()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no nouveau DRM node found"))?;
        let file = open_with_retries(card)?;
        flock_exclusive(file.as_raw_fd())?;
        self.lock = Some(file);
        Ok(())
    }
}
