// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! PCI device enumeration and driver-binding inspection for the discrete and
//! integrated GPUs (component A).

use std::{
    fs::{self, read_to_string, write},
    io,
    path::PathBuf,
};

const PCI_CLASS_VGA: u32 = 0x0300_00;
const PCI_CLASS_3D: u32 = 0x0302_00;
const PCI_CONFIG_SAVE_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PciError {
    #[error("pci bus directory not found")]
    BusNotFound,
    #[error("no device found for vendor {vendor:#06x} at index {index}")]
    NotFound { vendor: u16, index: usize },
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, io::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, io::Error),
    #[error("'{0}' is not a valid bus id (expected BB:SS.F)")]
    InvalidBusId(String),
}

/// A packed `(bus, slot, func)` triple, round-trippable to `BB:SS.F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciBusId(u16);

impl PciBusId {
    pub fn new(bus: u8, slot: u8, func: u8) -> Self {
        debug_assert!(slot < 0x20 && func < 0x08);
        PciBusId((bus as u16) << 8 | (slot as u16) << 3 | func as u16)
    }

    pub fn bus(self) -> u8 { (self.0 >> 8) as u8 }

    pub fn slot(self) -> u8 { ((self.0 >> 3) & 0x1f) as u8 }

    pub fn func(self) -> u8 { (self.0 & 0x07) as u8 }

    pub fn as_u16(self) -> u16 { self.0 }

    pub fn from_u16(raw: u16) -> Self { PciBusId(raw) }

    /// Parses the canonical `BB:SS.F` text form (hex bus, hex slot, octal func).
    pub fn parse(s: &str) -> Result<Self, PciError> {
        let (bus_slot, func) = s.split_once('.').ok_or_else(|| PciError::InvalidBusId(s.to_owned()))?;
        let (bus, slot) = bus_slot.split_once(':').ok_or_else(|| PciError::InvalidBusId(s.to_owned()))?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| PciError::InvalidBusId(s.to_owned()))?;
        let slot = u8::from_str_radix(slot, 16).map_err(|_| PciError::InvalidBusId(s.to_owned()))?;
        let func = u8::from_str_radix(func, 8).map_err(|_| PciError::InvalidBusId(s.to_owned()))?;
        if slot >= 0x20 || func >= 0x08 {
            return Err(PciError::InvalidBusId(s.to_owned()));
        }
        Ok(PciBusId::new(bus, slot, func))
    }

    /// Canonical `%02x:%02x.%o` text form.
    pub fn to_canonical_string(self) -> String {
        format!("{:02x}:{:02x}.{:o}", self.bus(), self.slot(), self.func())
    }

    /// `PCI:bb:ss:o` form used on the Xorg command line (2-digit hex bus,
    /// 2-digit hex slot, octal func).
    pub fn to_xorg_arg(self) -> String {
        format!("PCI:{:02x}:{:02x}:{:o}", self.bus(), self.slot(), self.func())
    }

    fn sysfs_path(self) -> PathBuf {
        PathBuf::from(format!("/sys/bus/pci/devices/0000:{}", self.to_canonical_string()))
    }
}

/// Handle to the PCI subsystem: rescans the bus and inspects individual devices.
pub struct PciBus {
    path: PathBuf,
}

impl PciBus {
    pub fn new() -> Result<Self, PciError> {
        let path = PathBuf::from("/sys/bus/pci");
        if path.is_dir() {
            Ok(Self { path })
        } else {
            Err(PciError::BusNotFound)
        }
    }

    pub fn rescan(&self) -> Result<(), PciError> {
        let path = self.path.join("rescan");
        write(&path, "1").map_err(|e| PciError::Write(path, e))
    }

    /// Returns the bus id of the `index`-th device (0-based) matching `vendor_id`
    /// whose PCI class is VGA (0x0300) or 3D (0x0302), in the order reported by
    /// `/proc/bus/pci/devices`.
    pub fn find_gfx_by_vendor(&self, vendor_id: u16, index: usize) -> Result<PciBusId, PciError> {
        let mut seen = 0usize;
        for (bus_id, dev_vendor) in proc_devices()? {
            if dev_vendor != vendor_id {
                continue;
            }
            if !matches!(device_class(bus_id), Ok(c) if c == PCI_CLASS_VGA || c == PCI_CLASS_3D) {
                continue;
            }
            if seen == index {
                return Ok(bus_id);
            }
            seen += 1;
        }
        Err(PciError::NotFound { vendor: vendor_id, index })
    }

    /// Reads the currently bound driver's name, or `None` if unbound.
    pub fn get_driver(&self, id: PciBusId) -> Option<String> {
        let link = id.sysfs_path().join("driver");
        let target = fs::read_link(&link).ok()?;
        target.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    /// Saves the first 64 bytes of configuration space, for backends that lose
    /// it across a power toggle.
    pub fn config_save(&self, id: PciBusId) -> Result<Vec<u8>, PciError> {
        let path = id.sysfs_path().join("config");
        let bytes = fs::read(&path).map_err(|e| PciError::Read(path, e))?;
        Ok(bytes.into_iter().take(PCI_CONFIG_SAVE_LEN).collect())
    }

    /// Restores configuration space previously captured with [`config_save`].
    pub fn config_restore(&self, id: PciBusId, saved: &[u8]) -> Result<(), PciError> {
        use std::io::{Seek, SeekFrom, Write};
        let path = id.sysfs_path().join("config");
        let mut file =
            fs::OpenOptions::new().write(true).open(&path).map_err(|e| PciError::Write(path.clone(), e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| PciError::Write(path.clone(), e))?;
        file.write_all(saved).map_err(|e| PciError::Write(path, e))
    }
}

fn device_class(id: PciBusId) -> Result<u32, PciError> {
    let path = id.sysfs_path().join("class");
    let text = read_to_string(&path).map_err(|e| PciError::Read(path, e))?;
    u32::from_str_radix(text.trim().trim_start_matches("0x"), 16).map_err(|_| PciError::NotFound {
        vendor: 0,
        index: 0,
    })
}

/// Parses `/proc/bus/pci/devices`: each line begins with a 4 hex-digit slot
/// (bus byte, then (device<<3|func) byte) followed by an 8 hex-digit
/// vendor+device id pair.
fn proc_devices() -> Result<Vec<(PciBusId, u16)>, PciError> {
    let text = read_to_string("/proc/bus/pci/devices")
        .map_err(|e| PciError::Read(PathBuf::from("/proc/bus/pci/devices"), e))?;

    let mut out = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let slot = match fields.next() {
            Some(s) => s,
            None => continue,
        };
        let vendor_device = match fields.next() {
            Some(s) => s,
            None => continue,
        };
        if slot.len() < 4 || vendor_device.len() < 8 {
            continue;
        }
        let bus = u8::from_str_radix(&slot[0..2], 16).unwrap_or(0);
        let devfn = u8::from_str_radix(&slot[2..4], 16).unwrap_or(0);
        let vendor = u16::from_str_radix(&vendor_device[0..4], 16).unwrap_or(0);
        out.push((PciBusId::new(bus, devfn >> 3, devfn & 0x07), vendor));
    }
    Ok(out)
}

pub const VENDOR_INTEL: u16 = 0x8086;
pub const VENDOR_NVIDIA: u16 = 0x10de;
pub const VENDOR_AMD: u16 = 0x1002;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_id_round_trips() {
        for raw in 0..0x10000u32 {
            let id = PciBusId::from_u16(raw as u16);
            let text = id.to_canonical_string();
            let parsed = PciBusId::parse(&text).unwrap();
            assert_eq!(parsed.as_u16(), id.as_u16());
        }
    }

    #[test]
    fn parse_canonical_form() {
        let id = PciBusId::parse("01:00.0").unwrap();
        assert_eq!(id.bus(), 0x01);
        assert_eq!(id.slot(), 0x00);
        assert_eq!(id.func(), 0);
        assert_eq!(id.to_canonical_string(), "01:00.0");
    }

    #[test]
    fn xorg_arg_format() {
        let id = PciBusId::new(1, 0, 0);
        assert_eq!(id.to_xorg_arg(), "PCI:01:00:0");
    }

    #[test]
    fn xorg_arg_format_hex_padding() {
        let id = PciBusId::new(0x10, 0x10, 5);
        assert_eq!(id.to_xorg_arg(), "PCI:10:10:5");
    }

    #[test]
    fn rejects_malformed_bus_id() {
        assert!(PciBusId::parse("nope").is_err());
        assert!(PciBusId::parse("01:00").is_err());
        assert!(PciBusId::parse("ff:20.0").is_err());
    }
}
