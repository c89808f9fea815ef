//! The wire-level half of the server: packet framing and the
//! single-connection-at-a-time accept loop.

pub mod connection;
pub mod framing;
