//! Command-line surface for the standalone binary, gated behind the
//! `build-binary` feature the library itself does not need.

use clap::Parser;

use crate::diag::DiagClass;
use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "mesh-gdb-server", about = "A GDB remote serial protocol server for a mesh accelerator")]
pub struct Cli {
    /// TCP port to listen on for GDB connections.
    #[arg(short = 'p', long, default_value_t = 51000)]
    pub port: u16,

    /// Serial device to open instead of a TCP listener, when driving
    /// real hardware over a UART bridge.
    #[arg(long)]
    pub tty: Option<String>,

    /// Number of mesh rows.
    #[arg(long, default_value_t = 4)]
    pub rows: u8,

    /// Number of mesh columns.
    #[arg(long, default_value_t = 4)]
    pub cols: u8,

    /// Leave cores running on attach instead of halting them.
    #[arg(long)]
    pub dont_halt_on_attach: bool,

    /// Validate addresses against the platform's known memory map
    /// instead of passing every access straight through to hardware.
    #[arg(long)]
    pub check_hw_address: bool,

    /// Maximum RSP packet size advertised via `qSupported`.
    #[arg(long, default_value_t = 4096)]
    pub packet_size: u32,

    /// Enable a diagnostic trace class; repeatable.
    #[arg(short = 'd', long = "diag", value_name = "CLASS")]
    pub diag: Vec<DiagClass>,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            halt_on_attach: !self.dont_halt_on_attach,
            check_hw_address: self.check_hw_address,
            packet_size: self.packet_size,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_classic_server() {
        let cli = Cli::parse_from(["mesh-gdb-server"]);
        assert_eq!(cli.port, 51000);
        assert!(!cli.dont_halt_on_attach);
        assert!(cli.server_config().halt_on_attach);
    }

    #[test]
    fn diag_flag_is_repeatable() {
        let cli = Cli::parse_from(["mesh-gdb-server", "-d", "timing", "-d", "ctrl-c-wait"]);
        assert_eq!(cli.diag, vec![DiagClass::Timing, DiagClass::CtrlCWait]);
    }
}
