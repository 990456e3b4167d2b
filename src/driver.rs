// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! Driver selection (component D): honors an explicit configuration, else
//! falls back through compile-time defaults, already-loaded candidates, and
//! probe-loadable modules.

use crate::{
    config::{defaults, Config},
    module,
};

/// Fills in `config.driver`, `config.driver_module`, `config.ld_path` and
/// `config.mod_path` if they are not already set, following the precedence:
/// explicit config > compile-time default > already-loaded nouveau >
/// probe-loadable nvidia > probe-loadable nouveau.
pub fn detect(config: &mut Config) {
    if !config.driver.is_empty() {
        log::debug!("Skipping auto-detection, using configured driver '{}'", config.driver);
    } else if !defaults::DRIVER.is_empty() {
        config.driver = defaults::DRIVER.to_owned();
        log::debug!("Using compile default driver '{}'", defaults::DRIVER);
    } else if module::is_loaded("nouveau") {
        config.driver = "nouveau".to_owned();
        config.driver_module = "nouveau".to_owned();
        log::debug!("Detected nouveau driver");
    } else if module::is_available(defaults::DRIVER_MODULE_NVIDIA) {
        config.driver = "nvidia".to_owned();
        config.driver_module = defaults::DRIVER_MODULE_NVIDIA.to_owned();
        log::debug!("Detected nvidia driver (module {})", defaults::DRIVER_MODULE_NVIDIA);
    } else if module::is_available("nouveau") {
        config.driver = "nouveau".to_owned();
        config.driver_module = "nouveau".to_owned();
        log::debug!("Detected nouveau driver");
    }

    if config.driver_module.is_empty() {
        if config.driver == "nvidia" && module::is_available(defaults::DRIVER_MODULE_NVIDIA) {
            config.driver_module = defaults::DRIVER_MODULE_NVIDIA.to_owned();
        } else {
            config.driver_module = config.driver.clone();
        }
    }

    if config.driver == "nvidia" {
        if config.ld_path.is_empty() {
            config.ld_path = defaults::LDPATH_NVIDIA.to_owned();
        }
        if config.mod_path.is_empty() {
            config.mod_path = defaults::MODPATH_NVIDIA.to_owned();
        }
    }

    log::info!("Using driver '{}' (module '{}')", config.driver, config.driver_module);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_driver_is_honored() {
        let mut config = Config::default();
        config.driver = "nvidia".to_owned();
        detect(&mut config);
        assert_eq!(config.driver, "nvidia");
        assert_eq!(config.ld_path, defaults::LDPATH_NVIDIA);
    }
}
