//! Core data types for passtor

use crate::{proto, Error, Result};
use std::fmt;
use std::net::SocketAddr;

/// Size in bytes of a [`Hash`]
pub const HASH_SIZE: usize = 32;

/// Size in bits of a [`Hash`], also the number of routing buckets
pub const HASH_BITS: usize = HASH_SIZE * 8;

/// A 32-byte BLAKE3 hash, used both as node identifier and as account key.
///
/// Arrays order lexicographically, which is the total order the DHT relies on
/// when ranking XOR distances.
pub type Hash = [u8; HASH_SIZE];

/// Hash arbitrary bytes
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Derive a node identifier from the node's display name
pub fn node_id_from_name(name: &str) -> Hash {
    hash(name.as_bytes())
}

/// Derive the DHT key of an account from its user-facing identifier
pub fn account_id(username: &str) -> Hash {
    hash(username.as_bytes())
}

/// Helper to format a hash as hex string
pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Short hex prefix of a hash, for log lines
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..6])
}

/// Helper to parse a hex string into a hash
pub fn hex_to_hash(s: &str) -> std::result::Result<Hash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != HASH_SIZE {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Convert wire bytes into a hash, rejecting wrong lengths
pub fn bytes_to_hash(bytes: &[u8]) -> Result<Hash> {
    bytes
        .try_into()
        .map_err(|_| Error::InvalidData(format!("expected {} byte hash, got {}", HASH_SIZE, bytes.len())))
}

/// A reachable peer: its UDP address and node identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub addr: SocketAddr,
    pub node_id: Hash,
}

impl NodeAddr {
    pub fn new(addr: SocketAddr, node_id: Hash) -> Self {
        Self { addr, node_id }
    }

    pub fn to_proto(&self) -> proto::NodeAddr {
        proto::NodeAddr {
            address: self.addr.to_string(),
            node_id: self.node_id.to_vec(),
        }
    }

    pub fn from_proto(node: &proto::NodeAddr) -> Result<Self> {
        let addr = node
            .address
            .parse()
            .map_err(|_| Error::InvalidAddress(node.address.clone()))?;
        Ok(Self {
            addr,
            node_id: bytes_to_hash(&node.node_id)?,
        })
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", short_hex(&self.node_id), self.addr)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({})", self)
    }
}

/// Parse a comma separated list of `ip:port` peers. An empty list is valid.
pub fn parse_peers(list: &str) -> Result<Vec<SocketAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|p| p.parse().map_err(|_| Error::InvalidAddress(p.to_string())))
        .collect()
}
