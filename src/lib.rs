#![recursion_limit = "256"]

//! A GDB remote serial protocol server for a many-core mesh accelerator.
//!
//! [`rsp::connection::accept_loop`] drives one connection at a time
//! against a [`server::GdbServerCore`], which parses packets with
//! [`parser::parse_packet`] and issues register/memory/control
//! operations through [`target::Target`] onto a [`mmio::DeviceDriver`].

mod addr;
mod diag;
mod error;
mod matchpoint;
mod opcode;
mod process;
mod semihost;
mod signal;
mod stepping;
mod thread;

pub mod mmio;
pub mod parser;
pub mod rsp;
pub mod server;
pub mod target;

#[cfg(feature = "build-binary")]
pub mod cli;

pub use diag::{DiagClass, Diagnostics};
pub use error::{MeshError, MeshResult};
pub use mmio::{AddressValidation, DeviceDriver};
pub use server::{GdbServerCore, ServerConfig};
pub use target::{PlatformDescription, Target};

/// Serve GDB connections on `addr` against a mesh described by
/// `platform`, using `driver` to reach the hardware (or [`target::sim::SimDriver`]
/// in tests and demos). Runs until the listener itself errors; a
/// disconnecting client is not fatal.
pub async fn run<D: DeviceDriver + Clone>(
    addr: impl async_std::net::ToSocketAddrs,
    driver: D,
    platform: PlatformDescription,
    config: ServerConfig,
    diag: Diagnostics,
) -> std::io::Result<()> {
    let map = platform.address_map();
    let validation = if config.check_hw_address {
        mmio::AddressValidation::Strict
    } else {
        mmio::AddressValidation::Passthrough
    };
    rsp::connection::accept_loop(addr, move || {
        let gateway = mmio::MmioGateway::new(driver.clone(), map.clone(), validation);
        let target = Target::new(gateway, platform.clone());
        GdbServerCore::new(target, config.clone(), diag.clone())
    })
    .await
}
