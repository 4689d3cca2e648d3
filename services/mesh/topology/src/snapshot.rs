//! JSON snapshots of a crawl, so a map can be redrawn without the radio.

use mesh_wire::{MacAddr, MeshNeighbor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::TopologyError;
use crate::graph::{LinkKey, TopologyGraph};

/// What one bulb reported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulbObservation {
    /// Display name at crawl time
    #[serde(default)]
    pub name: String,
    /// Routing table as read
    #[serde(default)]
    pub raw_neighbors: Vec<MeshNeighbor>,
}

/// Persisted crawl result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshSnapshot {
    /// Observations per crawled bulb
    #[serde(default)]
    pub bulbs: BTreeMap<MacAddr, BulbObservation>,
    /// Averaged RSSI keyed `MAC|MAC`
    #[serde(default)]
    pub links: BTreeMap<String, f64>,
    /// Display names
    #[serde(default)]
    pub name_map: BTreeMap<MacAddr, String>,
}

impl MeshSnapshot {
    /// Capture observations, their averaged graph and known names
    pub fn from_observations(
        observations: &BTreeMap<MacAddr, Vec<MeshNeighbor>>,
        name_map: BTreeMap<MacAddr, String>,
    ) -> Self {
        let graph = TopologyGraph::from_observations(observations);
        let bulbs = observations
            .iter()
            .map(|(mac, neighbors)| {
                let name = name_map
                    .get(mac)
                    .cloned()
                    .unwrap_or_else(|| mac.to_string());
                (
                    *mac,
                    BulbObservation {
                        name,
                        raw_neighbors: neighbors.clone(),
                    },
                )
            })
            .collect();
        let links = graph
            .links()
            .iter()
            .map(|(key, rssi)| (key.to_string(), *rssi))
            .collect();

        Self {
            bulbs,
            links,
            name_map,
        }
    }

    /// Rebuild the graph from the stored links and bulbs
    pub fn graph(&self) -> Result<TopologyGraph, TopologyError> {
        let mut graph = TopologyGraph::new();
        for mac in self.bulbs.keys() {
            graph.add_node(*mac);
        }
        for (key, rssi) in &self.links {
            graph.insert_link(key.parse::<LinkKey>()?, *rssi);
        }
        Ok(graph)
    }

    /// Read a snapshot file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&data)?;
        info!(
            "Loaded {} bulbs and {} links from {}",
            snapshot.bulbs.len(),
            snapshot.links.len(),
            path.display()
        );
        Ok(snapshot)
    }

    /// Write a snapshot file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TopologyError> {
        let path = path.as_ref();
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Mesh data cached to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0xA4, 0xC1, 0x38, 0x00, 0x00, n])
    }

    fn observations() -> BTreeMap<MacAddr, Vec<MeshNeighbor>> {
        let mut obs = BTreeMap::new();
        obs.insert(
            mac(1),
            vec![MeshNeighbor {
                address: mac(2),
                hops: 1,
                rssi: -52,
            }],
        );
        obs.insert(
            mac(2),
            vec![MeshNeighbor {
                address: mac(1),
                hops: 1,
                rssi: -48,
            }],
        );
        obs
    }

    #[test]
    fn test_snapshot_file_layout() {
        let mut names = BTreeMap::new();
        names.insert(mac(1), "Desk".to_string());
        let snapshot = MeshSnapshot::from_observations(&observations(), names);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["bulbs"]["A4:C1:38:00:00:01"]["name"], "Desk");
        assert_eq!(json["bulbs"]["A4:C1:38:00:00:02"]["name"], "A4:C1:38:00:00:02");
        assert_eq!(
            json["bulbs"]["A4:C1:38:00:00:01"]["raw_neighbors"][0]["address"],
            "A4:C1:38:00:00:02"
        );
        assert_eq!(json["links"]["A4:C1:38:00:00:01|A4:C1:38:00:00:02"], -50.0);
        assert_eq!(json["name_map"]["A4:C1:38:00:00:01"], "Desk");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        let snapshot = MeshSnapshot::from_observations(&observations(), BTreeMap::new());
        snapshot.save(&path).unwrap();

        let loaded = MeshSnapshot::load(&path).unwrap();
        assert_eq!(loaded, snapshot);
        let graph = loaded.graph().unwrap();
        assert_eq!(graph.rssi(mac(2), mac(1)), Some(-50.0));
    }

    #[test]
    fn test_lowercase_and_reversed_link_keys() {
        let json = r#"{"links": {"a4:c1:38:00:00:09|A4:C1:38:00:00:03": -61.5}}"#;
        let snapshot: MeshSnapshot = serde_json::from_str(json).unwrap();
        let graph = snapshot.graph().unwrap();
        assert_eq!(graph.rssi(mac(3), mac(9)), Some(-61.5));
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_malformed_link_key() {
        let json = r#"{"links": {"not-a-pair": -40}}"#;
        let snapshot: MeshSnapshot = serde_json::from_str(json).unwrap();
        assert!(matches!(snapshot.graph(), Err(TopologyError::LinkKey(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MeshSnapshot::load(dir.path().join("absent.json")),
            Err(TopologyError::Io(_))
        ));
    }
}
