//! Authoritative game server.
//!
//! Accepts clients over TCP, verifies their UDP endpoints through a
//! code-echo handshake, and runs the single event loop that owns the
//! world model. All state mutation happens on that loop; gameplay deltas
//! go back out as UDP broadcasts.

pub mod connection;
pub mod network;
