use anyhow::Result;
use colored::*;
use std::process;

use clap::Parser;

use mesh_gdb_server::cli::Cli;
use mesh_gdb_server::target::sim::SimDriver;
use mesh_gdb_server::{run, Diagnostics, PlatformDescription};

fn main() {
    pretty_env_logger::init();
    match main_try() {
        Ok(()) => (),
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}

fn main_try() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.tty {
        log::warn!("--tty {path} requested, but this build has no trap-7 print redirection wired up yet; ignoring");
    }

    match std::env::var("MESH_TARGET_BACKEND").as_deref() {
        Ok("sim") | Err(_) => {}
        Ok(other) => log::warn!("MESH_TARGET_BACKEND={other} is not available in this build; using the in-memory simulator"),
    }

    let platform = PlatformDescription {
        rows: cli.rows,
        cols: cli.cols,
        external_banks: vec![],
    };
    let driver = SimDriver::new(cli.rows, cli.cols);
    let config = cli.server_config();
    let diag = Diagnostics::new(cli.diag.iter().copied());

    let addr = format!("127.0.0.1:{}", cli.port);
    println!("Firing up GDB stub at {addr}");

    async_std::task::block_on(run(addr, driver, platform, config, diag))?;

    Ok(())
}
