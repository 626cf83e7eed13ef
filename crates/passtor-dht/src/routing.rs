//! Kademlia routing table implementation
//!
//! Bucket `i` holds the peers whose XOR distance to the local node has exactly
//! `i` leading zero bits, so higher indices are closer. Every bucket sits
//! behind its own lock and the bucket vector itself never changes shape, so
//! concurrent handlers only contend when they touch the same bucket.

use crate::lock;
use passtor_core::{Hash, NodeAddr, HASH_BITS, HASH_SIZE};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Bucket index of the local node itself; it never holds entries
pub const SELF_BUCKET: usize = HASH_BITS;

/// XOR distance between two node IDs
pub fn xor_distance(a: &Hash, b: &Hash) -> Hash {
    let mut result = [0u8; HASH_SIZE];
    for i in 0..HASH_SIZE {
        result[i] = a[i] ^ b[i];
    }
    result
}

/// Number of leading zero bits of a hash
pub fn leading_zeros(hash: &Hash) -> usize {
    for (i, byte) in hash.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }
    HASH_BITS
}

/// Bucket of `target` as seen from `local`; equal IDs map to [`SELF_BUCKET`]
pub fn bucket_index(local: &Hash, target: &Hash) -> usize {
    leading_zeros(&xor_distance(local, target))
}

/// Outcome of offering a node to a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    /// Already known, moved to the head
    Touched,
    /// New entry at the head
    Inserted,
    /// Bucket is full; the caller should ping `tail` before evicting it
    Full { tail: NodeAddr },
    /// The local node is never stored
    Ignored,
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of nodes in this bucket
    k: usize,
    /// Nodes ordered most recently seen (front) to least recently seen (back)
    nodes: VecDeque<NodeAddr>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            nodes: VecDeque::with_capacity(k),
        }
    }

    /// Add or refresh a node
    pub fn upsert(&mut self, node: NodeAddr) -> Insertion {
        if self.touch(&node) {
            return Insertion::Touched;
        }

        if self.nodes.len() < self.k {
            self.nodes.push_front(node);
            return Insertion::Inserted;
        }

        match self.nodes.back() {
            Some(tail) => Insertion::Full { tail: *tail },
            None => Insertion::Ignored,
        }
    }

    /// Move a known node to the head, refreshing its address.
    /// Returns false if the node is not in the bucket.
    pub fn touch(&mut self, node: &NodeAddr) -> bool {
        match self.nodes.iter().position(|n| n.node_id == node.node_id) {
            Some(pos) => {
                self.nodes.remove(pos);
                self.nodes.push_front(*node);
                true
            }
            None => false,
        }
    }

    /// Evict `old` in favour of `new`. Does nothing if `old` is gone already
    /// or `new` got in meanwhile.
    pub fn replace(&mut self, old: &NodeAddr, new: NodeAddr) -> bool {
        if self.contains(&new.node_id) {
            return false;
        }
        match self.nodes.iter().position(|n| n.node_id == old.node_id) {
            Some(pos) => {
                self.nodes.remove(pos);
                self.nodes.push_front(new);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, node_id: &Hash) -> Option<NodeAddr> {
        let pos = self.nodes.iter().position(|n| &n.node_id == node_id)?;
        self.nodes.remove(pos)
    }

    pub fn contains(&self, node_id: &Hash) -> bool {
        self.nodes.iter().any(|n| &n.node_id == node_id)
    }

    /// Get all nodes in the bucket, most recently seen first
    pub fn nodes(&self) -> impl Iterator<Item = &NodeAddr> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our own address and ID
    local: NodeAddr,
    /// One bucket per possible shared-prefix length
    buckets: Vec<Mutex<KBucket>>,
    /// K parameter
    k: usize,
}

impl RoutingTable {
    pub fn new(local: NodeAddr, k: usize) -> Self {
        Self {
            local,
            buckets: (0..HASH_BITS).map(|_| Mutex::new(KBucket::new(k))).collect(),
            k,
        }
    }

    pub fn local(&self) -> &NodeAddr {
        &self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn bucket_of(&self, node_id: &Hash) -> Option<&Mutex<KBucket>> {
        self.buckets.get(bucket_index(&self.local.node_id, node_id))
    }

    /// Offer a node to its bucket. Eviction of a full bucket's tail is left
    /// to the caller, which has to ping it first.
    pub fn insert(&self, node: NodeAddr) -> Insertion {
        match self.bucket_of(&node.node_id) {
            Some(bucket) => lock(bucket).upsert(node),
            None => Insertion::Ignored,
        }
    }

    /// Mark a node as recently seen
    pub fn touch(&self, node: &NodeAddr) -> bool {
        self.bucket_of(&node.node_id)
            .map(|bucket| lock(bucket).touch(node))
            .unwrap_or(false)
    }

    /// Replace an unresponsive entry with a new node of the same bucket
    pub fn replace(&self, old: &NodeAddr, new: NodeAddr) -> bool {
        if bucket_index(&self.local.node_id, &old.node_id)
            != bucket_index(&self.local.node_id, &new.node_id)
        {
            return false;
        }
        self.bucket_of(&new.node_id)
            .map(|bucket| lock(bucket).replace(old, new))
            .unwrap_or(false)
    }

    pub fn remove(&self, node_id: &Hash) -> Option<NodeAddr> {
        self.bucket_of(node_id)
            .and_then(|bucket| lock(bucket).remove(node_id))
    }

    pub fn contains(&self, node_id: &Hash) -> bool {
        self.bucket_of(node_id)
            .map(|bucket| lock(bucket).contains(node_id))
            .unwrap_or(false)
    }

    /// Total number of known peers
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| lock(b).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every non-empty bucket with its index
    pub fn snapshot(&self) -> Vec<(usize, Vec<NodeAddr>)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                let bucket = lock(b);
                (!bucket.is_empty()).then(|| (i, bucket.nodes().copied().collect()))
            })
            .collect()
    }

    /// Find up to `count` known nodes closest to a target.
    ///
    /// The target's own bucket is read first; only if it cannot fill the
    /// answer are the other buckets scanned. The result is sorted by
    /// ascending XOR distance with a stable sort.
    pub fn closest_nodes(&self, target: &Hash, count: usize) -> Vec<NodeAddr> {
        let target_bucket = bucket_index(&self.local.node_id, target);

        let mut nodes: Vec<NodeAddr> = match self.buckets.get(target_bucket) {
            Some(bucket) => lock(bucket).nodes().copied().collect(),
            None => Vec::new(),
        };

        if nodes.len() < count {
            for (i, bucket) in self.buckets.iter().enumerate() {
                if i != target_bucket {
                    nodes.extend(lock(bucket).nodes().copied());
                }
            }
        }

        nodes.sort_by_key(|n| xor_distance(&n.node_id, target));
        nodes.truncate(count);
        nodes
    }
}
