//! Error taxonomy for the mesh debug server.
//!
//! Every public operation in this crate reports failure through one of the
//! variants below rather than a bare `bool`/`Option`, the way the
//! hardware-facing half of `probe-rs` threads a typed `Error` through
//! `Core`/`Session`. The dispatcher decides, per call site, whether a
//! `MeshError` becomes a client-visible `E01`/`E02`/`E03`, a logged
//! warning, or a fatal exit — see `server::GdbServerCore`.

use thiserror::Error;

use crate::addr::CoreId;

/// A single error type covering every failure category the core can hit.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A packet could not be parsed, had a bad checksum, or referenced an
    /// opcode the dispatcher does not recognise.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An access fell outside a core's mapped SRAM/register range, or hit
    /// an address with no classification while strict validation is on.
    #[error("address {addr:#010x} is out of bounds ({reason})")]
    Bounds { addr: u32, reason: &'static str },

    /// A hardware operation did not complete as expected: a short burst,
    /// a DMA channel that never went idle, a core stuck mid external
    /// fetch, or a halt that did not land within its timeout.
    #[error("hardware operation failed on core {core:?}: {reason}")]
    Hardware { core: Option<CoreId>, reason: String },

    /// The debugger-side half of a semi-hosting exchange sent something
    /// the server could not make sense of.
    #[error("semihosting error: {0}")]
    SemiHosting(String),

    /// The server could not come up: bad configuration, a port already in
    /// use, or a platform description that failed to parse.
    #[error("startup failed: {0}")]
    Startup(String),
}

impl MeshError {
    pub fn bounds(addr: u32, reason: &'static str) -> Self {
        MeshError::Bounds { addr, reason }
    }

    pub fn hardware(core: impl Into<Option<CoreId>>, reason: impl Into<String>) -> Self {
        MeshError::Hardware {
            core: core.into(),
            reason: reason.into(),
        }
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
