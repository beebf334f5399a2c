//! Game client.
//!
//! Connects to a server over TCP, proves its UDP endpoint by echoing the
//! server's verification code, and keeps a replica of the authoritative
//! world in sync from the snapshot stream and gameplay broadcasts.

pub mod network;
