// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! The control loop (component H, loop half): discovers the GPU pair, builds
//! the `ServiceContext`, binds the listen socket, and multiplexes it, the
//! display-server stderr pipe, and every client socket with `libc::poll`
//! until the listen socket is closed.

use crate::{
    config::Config,
    display, driver,
    errors::LastError,
    ipc, module,
    pci::{self, PciBus},
    power,
    process::ProcessSupervisor,
    session::SessionList,
    signals,
    state::{RunMode, ServiceContext},
};
use std::{mem, os::unix::io::RawFd, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("no integrated video card found")]
    NoIntegratedCard,
    #[error("no discrete video card found")]
    NoDiscreteCard,
    #[error(transparent)]
    Pci(#[from] pci::PciError),
    #[error("no usable power backend detected")]
    NoPowerBackend,
    #[error(transparent)]
    Ipc(#[from] ipc::IpcError),
}

/// Finds the integrated card (first Intel device, falling back to a second
/// nvidia device for dual-nvidia boards) and the discrete card (first nvidia
/// device), mirroring the historical detection order.
fn find_cards(bus: &PciBus) -> Result<(pci::PciBusId, pci::PciBusId), StartupError> {
    let integrated = bus
        .find_gfx_by_vendor(pci::VENDOR_INTEL, 0)
        .or_else(|_| bus.find_gfx_by_vendor(pci::VENDOR_NVIDIA, 1))
        .map_err(|_| StartupError::NoIntegratedCard)?;

    let discrete = bus.find_gfx_by_vendor(pci::VENDOR_NVIDIA, 0).map_err(|_| StartupError::NoDiscreteCard)?;

    Ok((integrated, discrete))
}

/// Builds the fully wired service state: discovers the GPU pair, detects the
/// driver and power backend, and constructs an otherwise-idle `ServiceContext`.
/// Does not yet bind the listen socket.
pub fn build_context(mut config: Config) -> Result<ServiceContext, StartupError> {
    let pci_bus = PciBus::new()?;
    let (integrated, discrete) = find_cards(&pci_bus)?;
    log::debug!("Found card: {} (discrete)", discrete.to_canonical_string());
    log::debug!("Found card: {} (integrated)", integrated.to_canonical_string());

    driver::detect(&mut config);

    let backend_name = config.pm_method().as_backend_name();
    let info = power::SwitchInfo { pm_method: &config.pm_method, driver: &config.driver };
    let backend = power::detect(backend_name, &info).ok_or(StartupError::NoPowerBackend)?;
    log::info!("Selected power backend '{}'", backend.name());

    Ok(ServiceContext {
        config,
        pci_bus,
        discrete,
        backend,
        supervisor: ProcessSupervisor::new(),
        display: display::DisplayHandle::new(),
        sessions: SessionList::new(),
        last_error: LastError::new(),
        refcount: 0,
        run_mode: RunMode::Server,
    })
}

fn poll_fd(fd: RawFd) -> libc::pollfd { libc::pollfd { fd, events: libc::POLLIN, revents: 0 } }

/// Builds the poll set for one loop iteration: the listen socket, the
/// display stderr pipe if open, and every live client socket, in that order.
fn build_pollset(listen_fd: RawFd, ctx: &ServiceContext) -> Vec<libc::pollfd> {
    let mut fds = vec![poll_fd(listen_fd)];
    if ctx.display.stderr_fd() >= 0 {
        fds.push(poll_fd(ctx.display.stderr_fd()));
    }
    for session in ctx.sessions.iter() {
        fds.push(poll_fd(session.fd()));
    }
    fds
}

fn readable(pollfd: &libc::pollfd) -> bool { pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 }

fn log_pending_signals() {
    if signals::take_sighup() {
        log::warn!("received SIGHUP; configuration is not reloaded at runtime");
    }
    let pipes = signals::sigpipe_count();
    if pipes > 0 && pipes <= signals::SIGPIPE_LOG_THRESHOLD {
        log::debug!("received SIGPIPE ({} total)", pipes);
    }
}

/// Runs the control loop to completion: accepts connections, drains the
/// display stderr pipe, dispatches client protocol messages, reaps closed
/// sessions, and observes the SIGHUP/SIGPIPE flags each iteration. Returns
/// once the listen socket has been closed (by a shutdown signal or an
/// unrecoverable poll error).
pub fn run(ctx: &mut ServiceContext, listen_fd: RawFd) {
    log::info!("Initialization completed - now handling client requests");
    signals::set_listen_fd(listen_fd);

    loop {
        ctx.supervisor.reap();

        let stderr_open = ctx.display.stderr_fd() >= 0;
        let n_sessions = ctx.sessions.len();
        let mut fds = build_pollset(listen_fd, ctx);

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                log_pending_signals();
                continue;
            }
            log::error!("poll() failed: {}", err);
            break;
        }

        // fds[0] is the listen socket; a hangup there means a shutdown-signal
        // handler already closed it, which is what ends the loop.
        if fds[0].revents & (libc::POLLHUP | libc::POLLNVAL) != 0 {
            break;
        }
        if readable(&fds[0]) {
            match ipc::accept(listen_fd) {
                Ok(Some(fd)) => {
                    log::debug!("accepted new connection");
                    ctx.sessions.push(fd);
                }
                Ok(None) => {}
                Err(e) => log::warn!("accept() failed: {}", e),
            }
        }

        let mut next = 1;
        if stderr_open {
            if readable(&fds[next]) {
                display::check_pipe(ctx);
            }
            next += 1;
        }

        // Moved out of `ctx` for the duration of dispatch: `SessionList`'s
        // methods take `&mut ServiceContext` themselves, which would
        // otherwise alias `ctx.sessions` with the `ctx` argument.
        let mut sessions = mem::take(&mut ctx.sessions);
        for i in 0..n_sessions {
            if readable(&fds[next + i]) {
                let fd = sessions.iter().nth(i).map(|s| s.fd()).unwrap_or(-1);
                match ipc::read_chunk(fd) {
                    Ok(ipc::ReadOutcome::Data(chunk)) => sessions.dispatch(ctx, i, &chunk),
                    Ok(ipc::ReadOutcome::Closed) => sessions.mark_closed(i),
                    Ok(ipc::ReadOutcome::WouldBlock) => {}
                    Err(e) => {
                        log::warn!("read() failed on session socket: {}", e);
                        sessions.mark_closed(i);
                    }
                }
            }
        }
        sessions.reap(ctx);
        ctx.sessions = sessions;

        log_pending_signals();
    }

    signals::clear_listen_fd();
}

/// Binds the listen socket, resets the secondary stack (nobody is connected
/// yet), and runs the loop. On return, tears everything down and restores
/// the configured shutdown power state.
pub fn start(ctx: &mut ServiceContext, socket_path: &Path) -> Result<(), StartupError> {
    let listen_fd = ipc::bind_listener(socket_path)?;
    display::stop_secondary(ctx, false);

    run(ctx, listen_fd);

    ctx.run_mode = RunMode::Exit;
    shutdown(ctx, listen_fd, socket_path);
    Ok(())
}

/// Mirrors the historical shutdown order: close every session (warning if
/// any still counted against the refcount), unlink the socket, restore the
/// configured shutdown power state, and stop any processes left running.
fn shutdown(ctx: &mut ServiceContext, listen_fd: RawFd, socket_path: &Path) {
    if ctx.refcount != 0 {
        log::warn!("shutting down with {} session(s) still counting against refcount", ctx.refcount);
    }
    ctx.sessions.close_all();
    ipc::close_listener(listen_fd, socket_path);

    match ctx.config.card_shutdown_state() {
        crate::config::CardShutdownState::On => {
            let _ = display::start_secondary(ctx, false);
        }
        crate::config::CardShutdownState::Off => {
            display::stop_secondary(ctx, true);
        }
    }

    ctx.supervisor.stop_all(signals::is_fast_shutdown());
}

/// Validates that the configured driver's kernel module is either already
/// loaded or resolvable, ahead of binding the socket. A fatal startup
/// condition if neither holds.
pub fn validate_driver_available(config: &Config) -> Result<(), module::ModuleError> {
    if config.driver_module.is_empty() {
        return Ok(());
    }
    if module::is_loaded(&config.driver) || module::is_available(&config.driver_module) {
        Ok(())
    } else {
        Err(module::ModuleError::NotFound(config.driver_module.clone()))
    }
}
