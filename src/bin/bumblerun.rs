// Copyright 2018-2021 System76 <info@system76.com>
//
// SPDX-License-Identifier: GPL-3.0-only

//! `bumblerun`, the client launcher binary (component I / SPEC_FULL.md §6).

use bumbled::{client, config::defaults};
use clap::Parser;
use log::LevelFilter;

/// Run a program on the discrete GPU via bumbled.
#[derive(Parser, Debug)]
#[command(name = "bumblerun", version)]
struct Cli {
    /// Path to the bumbled control socket.
    #[arg(long, default_value = defaults::SOCKET_PATH)]
    socket: String,

    /// Print the daemon's status and exit.
    #[arg(long)]
    status: bool,

    /// Acceleration bridge to use: primus, virtualgl, or none. Defaults to
    /// auto-probing primus then virtualgl.
    #[arg(long)]
    bridge: Option<String>,

    /// JPEG compression method passed to `vglrun -c`.
    #[arg(long, default_value = "proxy")]
    vgl_compress: String,

    /// Extra options appended to the vglrun command line.
    #[arg(long, default_value = "")]
    vgl_options: String,

    /// Colon-separated search path for primus's libGL.so.1.
    #[arg(long, default_value = "/usr/lib/primus:/usr/lib32/primus")]
    primus_ldpath: String,

    /// Run the program directly, without a secondary X server or bridge.
    #[arg(long)]
    no_xorg: bool,

    /// Run the program directly if the daemon is unreachable or refuses
    /// the session (the default).
    #[arg(long, overrides_with = "no_failsafe")]
    failsafe: bool,

    /// Disable the direct-run fallback: fail instead of running without
    /// acceleration.
    #[arg(long)]
    no_failsafe: bool,

    /// Increase logging verbosity; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all logging except errors.
    #[arg(short, long)]
    quiet: bool,

    /// The program to run, and its arguments.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn verbosity_filter(cli: &Cli) -> LevelFilter {
    if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = bumbled::logging::setup(verbosity_filter(&cli), false) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let fallback_start = !cli.no_failsafe;

    let opts = client::ClientOptions {
        socket_path: cli.socket,
        status: cli.status,
        bridge: cli.bridge,
        vgl_compress: cli.vgl_compress,
        vgl_options: cli.vgl_options,
        primus_ldpath: cli.primus_ldpath,
        fallback_start,
        no_xorg: cli.no_xorg,
        command: cli.command,
    };

    match client::run(opts) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }
}
