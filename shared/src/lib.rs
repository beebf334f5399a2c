//! Shared protocol, navigation and world-model code used by both the
//! authoritative server and the replica client.
//!
//! The crate is pure logic: no sockets, no timers. The `server` and `client`
//! crates own the transports and feed bytes through [`command::handle_incoming`].

pub mod command;
pub mod nav;
pub mod protocol;
pub mod world;

/// Wire protocol revision carried in every Authentication message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for the reliable control channel.
pub const DEFAULT_TCP_PORT: u16 = 10429;

/// Default port for the unreliable gameplay channel.
pub const DEFAULT_UDP_PORT: u16 = 20429;

/// Default cube-figure size for the region grid (faces are S x S).
pub const DEFAULT_FIGURE_SIZE: i32 = 8;

/// Largest cube-figure size whose 3S x 4S strip still fits the wire's u8
/// grid dimension fields.
pub const MAX_FIGURE_SIZE: i32 = 63;
