//! Human readable dumps of routing state, used in debug logs

use crate::routing::{leading_zeros, xor_distance, RoutingTable};
use passtor_core::{short_hex, Hash, NodeAddr};
use std::fmt::Write;

/// One line per non-empty bucket: index, size and members
pub fn format_routing_table(table: &RoutingTable) -> String {
    let mut out = format!("local {}", table.local());
    for (index, nodes) in table.snapshot() {
        let members: Vec<String> = nodes.iter().map(ToString::to_string).collect();
        let _ = write!(out, "\n  bucket {index:3} [{}/{}] {}", nodes.len(), table.k(), members.join(", "));
    }
    out
}

/// Nodes with their distance to `target`, as shared prefix length and the
/// leading bytes of the XOR distance
pub fn format_distances<'a>(target: &Hash, nodes: impl IntoIterator<Item = &'a NodeAddr>) -> String {
    let mut out = format!("target {}", short_hex(target));
    for node in nodes {
        let distance = xor_distance(&node.node_id, target);
        let _ = write!(
            out,
            "\n  {node} prefix {:3} distance {}",
            leading_zeros(&distance),
            short_hex(&distance)
        );
    }
    out
}
