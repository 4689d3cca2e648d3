//! Undirected link graph built from routing table observations.

use mesh_wire::{MacAddr, MeshNeighbor};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::TopologyError;

/// Unordered node pair, stored with the smaller address first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    a: MacAddr,
    b: MacAddr,
}

impl LinkKey {
    /// Normalize a pair; `None` for a self-link
    pub fn new(x: MacAddr, y: MacAddr) -> Option<Self> {
        match x.cmp(&y) {
            std::cmp::Ordering::Less => Some(Self { a: x, b: y }),
            std::cmp::Ordering::Greater => Some(Self { a: y, b: x }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Both endpoints, smaller first
    pub fn endpoints(&self) -> (MacAddr, MacAddr) {
        (self.a, self.b)
    }

    /// Whether `mac` is one of the endpoints
    pub fn touches(&self, mac: &MacAddr) -> bool {
        self.a == *mac || self.b == *mac
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.a, self.b)
    }
}

impl FromStr for LinkKey {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TopologyError::LinkKey(s.to_string());
        let (x, y) = s.split_once('|').ok_or_else(malformed)?;
        let x: MacAddr = x.trim().parse().map_err(|_| malformed())?;
        let y: MacAddr = y.trim().parse().map_err(|_| malformed())?;
        LinkKey::new(x, y).ok_or_else(malformed)
    }
}

impl Serialize for LinkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LinkKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Nodes and averaged link strengths
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyGraph {
    nodes: BTreeSet<MacAddr>,
    links: BTreeMap<LinkKey, f64>,
}

impl TopologyGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Average each node pair's observations into one link.
    ///
    /// Every observing node is kept even when it reported nothing. Readings
    /// of exactly 0 dBm are discarded.
    pub fn from_observations(observations: &BTreeMap<MacAddr, Vec<MeshNeighbor>>) -> Self {
        let mut samples: BTreeMap<LinkKey, Vec<i8>> = BTreeMap::new();
        let mut graph = Self::new();

        for (observer, neighbors) in observations {
            graph.nodes.insert(*observer);
            for neighbor in neighbors.iter().filter(|n| n.has_signal()) {
                if let Some(key) = LinkKey::new(*observer, neighbor.address) {
                    samples.entry(key).or_default().push(neighbor.rssi);
                }
            }
        }

        for (key, rssis) in samples {
            let sum: f64 = rssis.iter().map(|&r| f64::from(r)).sum();
            graph.insert_link(key, sum / rssis.len() as f64);
        }
        graph
    }

    /// Add a node with no links
    pub fn add_node(&mut self, mac: MacAddr) {
        self.nodes.insert(mac);
    }

    /// Set a link's averaged RSSI, adding its endpoints as nodes
    pub fn insert_link(&mut self, key: LinkKey, rssi: f64) {
        let (a, b) = key.endpoints();
        self.nodes.insert(a);
        self.nodes.insert(b);
        self.links.insert(key, rssi);
    }

    /// Nodes in address order
    pub fn nodes(&self) -> &BTreeSet<MacAddr> {
        &self.nodes
    }

    /// Links in key order
    pub fn links(&self) -> &BTreeMap<LinkKey, f64> {
        &self.links
    }

    /// Averaged RSSI between two nodes
    pub fn rssi(&self, x: MacAddr, y: MacAddr) -> Option<f64> {
        LinkKey::new(x, y).and_then(|key| self.links.get(&key).copied())
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Render the RSSI matrix as text, labelling nodes through `names`
    pub fn rssi_matrix(&self, names: &BTreeMap<MacAddr, String>) -> String {
        let labels: Vec<String> = self
            .nodes
            .iter()
            .map(|mac| {
                names
                    .get(mac)
                    .cloned()
                    .unwrap_or_else(|| mac.short_suffix())
            })
            .collect();
        let width = labels.iter().map(|l| l.len()).max().unwrap_or(0);

        let mut out = String::new();
        out.push_str(&" ".repeat(width + 3));
        for label in &labels {
            let short: String = label.chars().take(8).collect();
            out.push_str(&format!("{:>9}", short));
        }
        out.push('\n');

        for (row, label) in self.nodes.iter().zip(&labels) {
            out.push_str(&format!("{:<width$} |", label, width = width));
            for col in &self.nodes {
                if row == col {
                    out.push_str("    --   ");
                } else {
                    match self.rssi(*row, *col) {
                        Some(rssi) => out.push_str(&format!("{:>8} ", rssi.round() as i64)),
                        None => out.push_str("    .    "),
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}
