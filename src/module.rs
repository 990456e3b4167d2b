// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Kernel module load/unload engine (component B). Modelled on libkmod's
//! holders-first recursive unload, but driven entirely off `/proc/modules`,
//! `/sys/module/<name>/holders/` and `modprobe`/`rmmod`, since no libkmod
//! binding is part of this crate's dependency stack.

use crate::modprobe;
use std::{collections::HashSet, fs::read_to_string, io, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module '{0}' not found")]
    NotFound(String),
    #[error("failed to load module '{0}': {1}")]
    LoadFailed(String, io::Error),
    #[error("cannot unload '{name}': held by {refcount} other module(s)")]
    UnloadBusy { name: String, refcount: u32 },
    #[error("failed to unload module '{0}': {1}")]
    UnloadFailed(String, io::Error),
}

pub struct Module {
    pub name: String,
}

impl Module {
    pub fn all() -> io::Result<Vec<Self>> {
        read_to_string("/proc/modules")?.lines().map(parse).collect()
    }
}

fn parse(line: &str) -> io::Result<Module> {
    let name = line
        .split(' ')
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "module name not found"))?
        .to_string();

    Ok(Module { name })
}

/// Whether `driver` is currently loaded, per `/proc/modules`.
pub fn is_loaded(driver: &str) -> bool {
    Module::all().map(|mods| mods.iter().any(|m| m.name == driver)).unwrap_or(false)
}

/// Whether `module_name` can be resolved by modprobe's alias rules, without
/// actually loading it (a dry-run probe via `modprobe --dry-run`).
pub fn is_available(module_name: &str) -> bool { modprobe::resolvable(module_name) }

/// Loads `module_name` (providing driver `driver`) with the given options,
/// unless it is already loaded. No-op success if already loaded.
pub fn load(module_name: &str, driver: &str, options: &[&str]) -> Result<(), ModuleError> {
    if is_loaded(driver) {
        return Ok(());
    }
    log::info!("Loading driver '{}' (module '{}')", driver, module_name);
    modprobe::load(module_name, options).map_err(|e| ModuleError::LoadFailed(module_name.to_owned(), e))
}

/// Unloads `driver`, recursing into holders first. No-op success if not loaded.
pub fn unload(driver: &str) -> Result<(), ModuleError> {
    if !is_loaded(driver) {
        return Ok(());
    }
    let mut visited = HashSet::new();
    unload_recursive(driver, &mut visited)
}

fn unload_recursive(name: &str, visited: &mut HashSet<String>) -> Result<(), ModuleError> {
    if !visited.insert(name.to_owned()) {
        // already handled this module on another branch of the holder graph
        return Ok(());
    }

    for holder in holders(name) {
        unload_recursive(&holder, visited)?;
    }

    let refcount = refcount(name);
    if refcount != 0 {
        log::error!("Failed to unload module '{}' (ref count: {})", name, refcount);
        return Err(ModuleError::UnloadBusy { name: name.to_owned(), refcount });
    }

    log::info!("Unloading module {}", name);
    modprobe::unload(name).map_err(|e| ModuleError::UnloadFailed(name.to_owned(), e))
}

fn holders(name: &str) -> Vec<String> {
    let path = PathBuf::from(format!("/sys/module/{}/holders", name));
    match path.read_dir() {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn refcount(name: &str) -> u32 {
    read_to_string(format!("/sys/module/{}/refcnt", name))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_modules_line() {
        let m = parse("nouveau 2105344 2 drm_kms_helper,bbswitch, Live 0xffffffffc0a00000").unwrap();
        assert_eq!(m.name, "nouveau");
    }
}
