//! passtor core - shared types, wire protocol, and account records
//!
//! This crate provides the building blocks shared by the DHT engine and the
//! node process: hashes and node addresses, the prost message schema spoken
//! between peers and by clients, and the signed account record.

pub mod account;
pub mod error;
pub mod proto;
pub mod types;

pub use account::{Account, Login};
pub use error::{Error, Result};
pub use types::*;

/// Peer protocol version carried in every envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single client request or response on the TCP listener
pub const TCP_MAX_PACKET_SIZE: usize = 64 * 1024;

/// Largest payload of a single UDP datagram over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Size of the UDP read buffer used by the peer protocol
pub const UDP_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE;
