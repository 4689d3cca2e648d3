//! Breadth-first mesh crawl.
//!
//! Each reachable bulb is connected to in turn and asked for its routing
//! table; every neighbor it reports is queued for a visit of its own. Busy
//! connects are retried, anything else skips the bulb for this pass.

use async_trait::async_trait;
use mesh_storage::Registry;
use mesh_topology::{MeshSnapshot, TopologyGraph};
use mesh_wire::{MacAddr, MeshNeighbor};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::manager::SessionManager;
use crate::retry::RetryPolicy;

/// Reads one bulb's routing table
#[async_trait]
pub trait NeighborProbe: Send + Sync {
    /// Connect to `address`, read its neighbors and disconnect
    async fn probe(&self, address: MacAddr) -> Result<Vec<MeshNeighbor>, SessionError>;
}

#[async_trait]
impl NeighborProbe for SessionManager {
    async fn probe(&self, address: MacAddr) -> Result<Vec<MeshNeighbor>, SessionError> {
        let session = self.open(address).await?;
        let neighbors = session.get_mesh_info().await;
        session.close().await;
        neighbors
    }
}

/// Outcome of a crawl
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlReport {
    /// Routing tables of the bulbs that answered
    pub observations: BTreeMap<MacAddr, Vec<MeshNeighbor>>,
    /// Bulbs given up on, with the last error
    pub skipped: BTreeMap<MacAddr, String>,
}

impl CrawlReport {
    /// Averaged link graph
    pub fn graph(&self) -> TopologyGraph {
        TopologyGraph::from_observations(&self.observations)
    }

    /// Snapshot for saving
    pub fn snapshot(&self, names: BTreeMap<MacAddr, String>) -> MeshSnapshot {
        MeshSnapshot::from_observations(&self.observations, names)
    }
}

/// BFS driver over a [`NeighborProbe`]
pub struct MeshCrawler {
    probe: Arc<dyn NeighborProbe>,
    retry: RetryPolicy,
}

impl MeshCrawler {
    /// Crawler retrying busy bulbs twice, 1.5 s apart
    pub fn new(probe: Arc<dyn NeighborProbe>) -> Self {
        Self {
            probe,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Visit every bulb reachable from `seeds`
    pub async fn crawl(&self, seeds: impl IntoIterator<Item = MacAddr>) -> CrawlReport {
        let mut queue: VecDeque<MacAddr> = VecDeque::new();
        let mut queued: HashSet<MacAddr> = HashSet::new();
        for seed in seeds {
            if queued.insert(seed) {
                queue.push_back(seed);
            }
        }
        info!("Crawling mesh starting from {} seed nodes", queue.len());

        let mut report = CrawlReport::default();
        while let Some(address) = queue.pop_front() {
            let what = format!("routing table read from {}", address);
            let result = self
                .retry
                .run(&what, || self.probe.probe(address), SessionError::is_transient)
                .await;

            match result {
                Ok(neighbors) => {
                    debug!("{} reports {} neighbors", address, neighbors.len());
                    for neighbor in &neighbors {
                        if queued.insert(neighbor.address) {
                            queue.push_back(neighbor.address);
                        }
                    }
                    report.observations.insert(address, neighbors);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", address, e);
                    report.skipped.insert(address, e.to_string());
                }
            }
        }

        info!(
            "Crawl finished: {} bulbs mapped, {} skipped",
            report.observations.len(),
            report.skipped.len()
        );
        report
    }
}

/// Starting points: explicit seeds, else the configured bulbs, else a scan
pub async fn resolve_seeds(
    manager: &SessionManager,
    explicit: &[MacAddr],
    scan_timeout: Duration,
) -> Result<Vec<MacAddr>, SessionError> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }

    let configured: Vec<MacAddr> = manager.registry().all_bulbs().await?.into_keys().collect();
    if !configured.is_empty() {
        return Ok(configured);
    }

    info!("No bulbs in config, scanning");
    let found = manager.discover(scan_timeout).await?;
    Ok(found.into_iter().map(|b| b.address).collect())
}

/// Display names from the registry, topped up by a scan.
///
/// Scan failures are logged and ignored.
pub async fn known_names(
    registry: &Registry,
    manager: &SessionManager,
    scan_timeout: Duration,
) -> Result<BTreeMap<MacAddr, String>, SessionError> {
    let mut names: BTreeMap<MacAddr, String> = registry
        .all_bulbs()
        .await?
        .into_iter()
        .map(|(mac, record)| (mac, record.name))
        .collect();

    match manager.discover(scan_timeout).await {
        Ok(found) => {
            for bulb in found {
                names
                    .entry(bulb.address)
                    .or_insert_with(|| bulb.name.unwrap_or_else(|| "Unknown".to_string()));
            }
        }
        Err(e) => warn!("Name scan failed: {}", e),
    }
    Ok(names)
}
