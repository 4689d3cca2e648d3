//! Strongest-path backbone over the link graph.
//!
//! Kruskal's algorithm on link strength: links are taken strongest first and
//! kept when they join two separate components, giving a maximum spanning
//! forest. Links reading 0 dBm or above, or below -100 dBm, never qualify.

use mesh_wire::MacAddr;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::graph::{LinkKey, TopologyGraph};

/// Weakest RSSI still considered a usable link
pub const MIN_VALID_RSSI: f64 = -100.0;

/// Whether an averaged reading describes a usable link
pub fn is_valid_rssi(rssi: f64) -> bool {
    rssi.is_finite() && (MIN_VALID_RSSI..0.0).contains(&rssi)
}

/// Disjoint sets over node indices with path halving
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Merge the sets of `a` and `b`; false when already joined
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

/// Valid links, strongest first, ties broken by node pair
fn ranked_links(graph: &TopologyGraph) -> Vec<(LinkKey, f64)> {
    let mut links: Vec<(LinkKey, f64)> = graph
        .links()
        .iter()
        .filter(|(_, rssi)| is_valid_rssi(**rssi))
        .map(|(key, rssi)| (*key, *rssi))
        .collect();
    links.sort_by(|(ka, ra), (kb, rb)| rb.total_cmp(ra).then_with(|| ka.cmp(kb)));
    links
}

/// Links selected as the mesh backbone
pub fn compute_backbone(graph: &TopologyGraph, redundancy: bool) -> BTreeSet<LinkKey> {
    let index: BTreeMap<MacAddr, usize> = graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(i, mac)| (*mac, i))
        .collect();
    let ranked = ranked_links(graph);

    let mut sets = DisjointSet::new(index.len());
    let mut backbone = BTreeSet::new();
    for (key, _) in &ranked {
        let (a, b) = key.endpoints();
        if let (Some(&ia), Some(&ib)) = (index.get(&a), index.get(&b)) {
            if sets.union(ia, ib) {
                backbone.insert(*key);
            }
        }
    }

    if redundancy {
        for mac in graph.nodes() {
            ranked
                .iter()
                .filter(|(key, _)| key.touches(mac))
                .take(2)
                .for_each(|(key, _)| {
                    backbone.insert(*key);
                });
        }
    }

    debug!(
        "Backbone has {} of {} links across {} nodes",
        backbone.len(),
        graph.links().len(),
        graph.node_count()
    );
    backbone
}
