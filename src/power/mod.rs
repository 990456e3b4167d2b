// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! The discrete GPU power switcher (component C): a polymorphic backend over
//! {ACPI-toggle, kernel-switch, nouveau-trick}, with a fixed-order, sticky
//! autodetection pass.

pub mod acpi;
pub mod kernel_switch;
pub mod nouveau;

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    On,
    Off,
    Unavailable,
}

/// Context passed to each backend's availability probe.
pub struct SwitchInfo<'a> {
    /// The operator's configured preference, e.g. `"bbswitch"`, `"switcheroo"`,
    /// `"nouveau"`, or `"auto"`.
    pub pm_method: &'a str,
    /// The currently selected driver name (e.g. `"nouveau"`, `"nvidia"`).
    pub driver: &'a str,
}

pub trait PowerBackend {
    fn name(&self) -> &'static str;

    /// Whether turning this backend off requires the GPU driver to be
    /// unloaded first.
    fn requires_driver_unload(&self) -> bool;

    fn status(&self) -> SwitchState;

    fn on(&mut self) -> io::Result<()>;

    fn off(&mut self) -> io::Result<()>;
}

type Probe = fn(&SwitchInfo) -> bool;
type Build = fn() -> Box<dyn PowerBackend>;

const BACKENDS: &[(&str, Probe, Build)] = &[
    ("bbswitch", acpi::is_available, || Box::new(acpi::AcpiToggle::new())),
    ("switcheroo", kernel_switch::is_available, || Box::new(kernel_switch::KernelSwitch::new())),
    ("nouveau", nouveau::is_available, || Box::new(nouveau::NouveauTrick::new())),
];

/// Probes backends in a fixed order and returns the first usable one. If
/// `name` is given, only that backend is considered. Selection is meant to be
/// sticky for the service lifetime: call once and hold onto the result.
pub fn detect(name: Option<&str>, info: &SwitchInfo) -> Option<Box<dyn PowerBackend>> {
    for (backend_name, is_available, build) in BACKENDS {
        if let Some(name) = name {
            if name != *backend_name {
                continue;
            }
        }
        if is_available(info) {
            return Some(build());
        }
    }
    None
}

/// Transitions the backend to On, logging the transition; idempotent.
pub fn switch_on(backend: &mut dyn PowerBackend) -> io::Result<SwitchState> {
    if backend.status() == SwitchState::On {
        return Ok(SwitchState::On);
    }
    log::info!("Switching dedicated card ON [{}]", backend.name());
    backend.on()?;
    Ok(backend.status())
}

/// Transitions the backend to Off, logging the transition; idempotent.
pub fn switch_off(backend: &mut dyn PowerBackend) -> io::Result<SwitchState> {
    if backend.status() == SwitchState::Off {
        return Ok(SwitchState::Off);
    }
    log::info!("Switching dedicated card OFF [{}]", backend.name());
    backend.off()?;
    Ok(backend.status())
}
