#![deny(clippy::all)]
#![allow(clippy::missing_safety_doc)]

//! `bumbled` manages discrete GPU power, kernel driver binding, and a
//! secondary X server for hybrid-graphics laptops, serving requests from
//! `bumblerun` over a local socket (see `ipc` and `session`).

pub mod client;
pub mod config;
pub mod daemon;
pub mod display;
pub mod driver;
pub mod errors;
pub mod ipc;
pub mod logging;
pub mod modprobe;
pub mod module;
pub mod pci;
pub mod power;
pub mod process;
pub mod session;
pub mod signals;
pub mod state;
