// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! The service-wide state owned solely by the control loop (SPEC_FULL.md §5):
//! the PCI bindings, the power backend, the process supervisor, the display
//! handle, the session list, and the first-error-wins store.

use crate::{
    config::Config,
    display::DisplayHandle,
    errors::LastError,
    pci::{PciBus, PciBusId},
    power::PowerBackend,
    process::ProcessSupervisor,
    session::SessionList,
};

/// The three run-mode states the control loop can be in, per the data model
/// in SPEC_FULL.md §3. `Server` is the ordinary event loop; `Daemon` is set
/// once the process has detached from its controlling terminal; `Exit` is
/// set by the shutdown sequence to break out of `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Server,
    Daemon,
    Exit,
}

pub struct ServiceContext {
    pub config: Config,
    pub pci_bus: PciBus,
    pub discrete: PciBusId,
    pub backend: Box<dyn PowerBackend>,
    pub supervisor: ProcessSupervisor,
    pub display: DisplayHandle,
    pub sessions: SessionList,
    pub last_error: LastError,
    pub refcount: u32,
    pub run_mode: RunMode,
}
