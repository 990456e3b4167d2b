// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! `bumbled`, the privileged service binary (SPEC_FULL.md §6).

use bumbled::{config::Config, daemon, logging, process, signals};
use clap::Parser;
use log::LevelFilter;
use std::{
    ffi::{CStr, CString},
    fs, io,
    path::{Path, PathBuf},
};

const DEFAULT_CONFIG_PATH: &str = "/etc/bumbled.toml";

/// Discrete-GPU power and secondary-display service.
#[derive(Parser, Debug)]
#[command(name = "bumbled", version)]
struct Cli {
    /// Detach from the controlling terminal and run in the background.
    #[arg(long)]
    daemon: bool,

    /// Path to the TOML config file.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Path to the Xorg config file template used for the secondary server.
    #[arg(long, value_name = "FILE")]
    xconf: Option<String>,

    /// Extra directory Xorg should search for its own config snippets.
    #[arg(long, value_name = "DIR")]
    xconfdir: Option<String>,

    /// Group whose members are allowed to use the service.
    #[arg(long)]
    group: Option<String>,

    /// Extra Xorg module search path for the discrete GPU's driver.
    #[arg(long, value_name = "PATH")]
    module_path: Option<String>,

    /// Driver to load for the secondary X server (nvidia, nouveau, ...).
    #[arg(long)]
    driver: Option<String>,

    /// Kernel module backing the chosen driver, if it differs from its name.
    #[arg(long)]
    driver_module: Option<String>,

    /// Power-management backend: auto, disabled, bbswitch, or switcheroo.
    #[arg(long, value_name = "METHOD")]
    pm_method: Option<String>,

    /// Log to syslog instead of stderr.
    #[arg(long)]
    use_syslog: bool,

    /// Write the service PID to this file and hold it as a single-instance lock.
    #[arg(long, value_name = "FILE")]
    pidfile: Option<String>,

    /// Display number to give the secondary X server.
    #[arg(long)]
    display: Option<String>,

    /// Path of the control socket clients connect to.
    #[arg(long)]
    socket: Option<String>,

    /// Extra library search path reported to clients.
    #[arg(long, value_name = "PATH")]
    ldpath: Option<String>,

    /// Suppress all logging except errors.
    #[arg(short, long)]
    quiet: bool,

    /// Log informational messages in addition to warnings and errors.
    #[arg(short, long)]
    verbose: bool,

    /// Log at maximum verbosity.
    #[arg(long)]
    debug: bool,
}

fn verbosity_filter(cli: &Cli) -> LevelFilter {
    if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else if cli.quiet {
        LevelFilter::Error
    } else {
        LevelFilter::Warn
    }
}

fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(v) = &cli.xconf {
        config.x_conf_file = v.clone();
    }
    if let Some(v) = &cli.xconfdir {
        config.x_conf_dir = Some(v.clone());
    }
    if let Some(v) = &cli.group {
        config.group_name = v.clone();
    }
    if let Some(v) = &cli.module_path {
        config.mod_path = v.clone();
    }
    if let Some(v) = &cli.driver {
        config.driver = v.clone();
    }
    if let Some(v) = &cli.driver_module {
        config.driver_module = v.clone();
    }
    if let Some(v) = &cli.pm_method {
        config.pm_method = v.clone();
    }
    if let Some(v) = &cli.pidfile {
        config.pidfile = Some(v.clone());
    }
    if let Some(v) = &cli.display {
        config.x_display = v.clone();
    }
    if let Some(v) = &cli.socket {
        config.socket_path = v.clone();
    }
    if let Some(v) = &cli.ldpath {
        config.ld_path = v.clone();
    }
    if cli.use_syslog {
        config.use_syslog = true;
    }
    config
}

/// The one config-validity condition that earns its own exit code rather
/// than being folded into the generic startup-error path.
fn validate(config: &Config) -> Result<(), String> {
    let known = ["auto", "disabled", "bbswitch", "switcheroo"];
    if !known.iter().any(|m| m.eq_ignore_ascii_case(&config.pm_method)) {
        return Err(format!("invalid --pm-method '{}', expected one of {:?}", config.pm_method, known));
    }
    Ok(())
}

/// Changes to the configured group and tightens the umask, mirroring the
/// historical privilege-drop step that ran right before daemonizing.
fn change_group(group_name: &str) -> io::Result<()> {
    if group_name.is_empty() {
        return Ok(());
    }
    let cname = CString::new(group_name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "group name contains a NUL"))?;
    let group = unsafe { libc::getgrnam(cname.as_ptr()) };
    if group.is_null() {
        return Err(io::Error::new(io::ErrorKind::NotFound, format!("no such group '{}'", group_name)));
    }
    let gid = unsafe { (*group).gr_gid };
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::umask(0o027) };
    Ok(())
}

/// Forks to the background, detaches from the controlling terminal, and
/// reroutes stdio to `/dev/null`. The parent exits; only the child returns.
fn daemonize() -> io::Result<()> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid > 0 {
        std::process::exit(0);
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }
    let root = CString::new("/").unwrap();
    if unsafe { libc::chdir(root.as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let devnull = CStr::from_bytes_with_nul(b"/dev/null\0").unwrap();
    let fd = unsafe { libc::open(devnull.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
    Ok(())
}

fn write_pidfile(path: &Path) -> io::Result<()> {
    fs::write(path, format!("{}\n", unsafe { libc::getpid() }))
}

const EXIT_OK: i32 = 0;
const EXIT_STARTUP_ERROR: i32 = 1;
const EXIT_CONFIG_INVALID: i32 = 2;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::setup(verbosity_filter(&cli), cli.use_syslog) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(EXIT_STARTUP_ERROR);
    }

    let config_path = cli.config.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let config = match Config::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(EXIT_CONFIG_INVALID);
        }
    };
    let config = apply_overrides(config, &cli);

    if let Err(e) = validate(&config) {
        log::error!("{}", e);
        std::process::exit(EXIT_CONFIG_INVALID);
    }

    if unsafe { libc::geteuid() } != 0 {
        log::error!("bumbled must be run as root");
        std::process::exit(EXIT_STARTUP_ERROR);
    }

    signals::install();
    process::install_sigchld_handler();

    if let Err(e) = daemon::validate_driver_available(&config) {
        log::error!("{}", e);
        std::process::exit(EXIT_STARTUP_ERROR);
    }

    let pidfile: Option<PathBuf> = config.pidfile.as_ref().map(PathBuf::from);

    if let Err(e) = change_group(&config.group_name) {
        log::error!("could not change group to '{}': {}", config.group_name, e);
        if let Some(path) = &pidfile {
            let _ = fs::remove_file(path);
        }
        std::process::exit(EXIT_STARTUP_ERROR);
    }

    let daemon_mode = cli.daemon;
    if daemon_mode {
        if let Err(e) = daemonize() {
            log::error!("could not fork to background: {}", e);
            if let Some(path) = &pidfile {
                let _ = fs::remove_file(path);
            }
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    }

    if let Some(path) = &pidfile {
        if let Err(e) = write_pidfile(path) {
            log::error!("could not write pidfile {:?}: {}", path, e);
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    }

    let socket_path = PathBuf::from(&config.socket_path);
    let mut ctx = match daemon::build_context(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("{}", e);
            if let Some(path) = &pidfile {
                let _ = fs::remove_file(path);
            }
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    };
    if daemon_mode {
        ctx.run_mode = bumbled::state::RunMode::Daemon;
    }

    log::info!("bumbled {} started", env!("CARGO_PKG_VERSION"));
    let result = daemon::start(&mut ctx, &socket_path);

    if let Some(path) = &pidfile {
        let _ = fs::remove_file(path);
    }

    match result {
        Ok(()) => std::process::exit(EXIT_OK),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    }
}
