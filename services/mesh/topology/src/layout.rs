//! Force-directed layout of the link graph.
//!
//! Nodes start evenly spaced on a circle and are moved by pairwise
//! inverse-square repulsion plus springs along every link whose rest length
//! grows as the signal weakens. Backbone springs pull harder than secondary
//! ones. Every run recomputes all positions from scratch.

use mesh_wire::MacAddr;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::TAU;
use tracing::debug;

use crate::graph::{LinkKey, TopologyGraph};

/// Floor used for distances so forces stay finite
const EPSILON: f64 = 0.1;

/// Spring rest length for an averaged reading, clamped to -100..=-30 dBm
pub fn rssi_to_distance(rssi: f64) -> f64 {
    let rssi = rssi.clamp(-100.0, -30.0);
    10f64.powf((-rssi - 10.0) / 25.0) * 50.0
}

/// Rectangle positions are kept inside
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
    /// Left edge
    pub min_x: f64,
    /// Right edge
    pub max_x: f64,
    /// Top edge
    pub min_y: f64,
    /// Bottom edge
    pub max_y: f64,
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            min_x: 100.0,
            max_x: 1500.0,
            min_y: 100.0,
            max_y: 900.0,
        }
    }
}

impl Canvas {
    /// Midpoint of the rectangle
    pub fn center(&self) -> Point {
        Point {
            x: (self.min_x + self.max_x) / 2.0,
            y: (self.min_y + self.max_y) / 2.0,
        }
    }

    fn clamp(&self, p: Point) -> Point {
        Point {
            x: p.x.clamp(self.min_x, self.max_x),
            y: p.y.clamp(self.min_y, self.max_y),
        }
    }

    /// Whether `p` lies inside, borders included
    pub fn contains(&self, p: Point) -> bool {
        (self.min_x..=self.max_x).contains(&p.x) && (self.min_y..=self.max_y).contains(&p.y)
    }
}

/// Simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Simulation steps
    pub iterations: usize,
    /// Repulsion constant between every node pair
    pub repulsion: f64,
    /// Base spring coefficient
    pub attraction: f64,
    /// Initial step damping, decays linearly to zero
    pub damping: f64,
    /// Largest move of one node in one step
    pub max_step: f64,
    /// Fraction of the distance to the center applied each step
    pub center_pull: f64,
    /// Radius of the starting circle
    pub radius: f64,
    /// Bounds
    pub canvas: Canvas,
    /// Seed for start-position jitter; no jitter when unset
    pub seed: Option<u64>,
    /// Largest jitter offset per axis
    pub jitter: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            iterations: 1200,
            repulsion: 1.2e6,
            attraction: 0.1,
            damping: 0.98,
            max_step: 50.0,
            center_pull: 0.002,
            radius: 650.0,
            canvas: Canvas::default(),
            seed: None,
            jitter: 25.0,
        }
    }
}

/// A position on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

/// Role of a drawn link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeClass {
    /// Part of the backbone
    Backbone,
    /// Any other link
    Secondary,
}

/// A classified link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutEdge {
    /// Endpoints
    pub link: LinkKey,
    /// Averaged RSSI
    pub rssi: f64,
    /// Backbone or secondary
    pub class: EdgeClass,
}

/// Final positions and classified edges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    /// Node positions
    pub positions: BTreeMap<MacAddr, Point>,
    /// Links in key order
    pub edges: Vec<LayoutEdge>,
}

impl Layout {
    /// Compute a layout for `graph`, weighting `backbone` links
    pub fn compute(graph: &TopologyGraph, backbone: &BTreeSet<LinkKey>, config: &LayoutConfig) -> Self {
        let nodes: Vec<MacAddr> = graph.nodes().iter().copied().collect();
        if nodes.is_empty() {
            return Self::default();
        }
        let index: BTreeMap<MacAddr, usize> = nodes.iter().enumerate().map(|(i, m)| (*m, i)).collect();

        let springs: Vec<(usize, usize, f64, f64)> = graph
            .links()
            .iter()
            .filter(|(_, rssi)| rssi.is_finite())
            .filter_map(|(key, rssi)| {
                let (a, b) = key.endpoints();
                let weight = if backbone.contains(key) { 2.0 } else { 0.5 };
                Some((
                    *index.get(&a)?,
                    *index.get(&b)?,
                    rssi_to_distance(*rssi),
                    config.attraction * weight,
                ))
            })
            .collect();

        let mut positions = initial_positions(nodes.len(), config);
        let center = config.canvas.center();
        let n = nodes.len();

        for step in 0..config.iterations {
            let mut forces = vec![Point { x: 0.0, y: 0.0 }; n];

            for i in 0..n {
                for j in (i + 1)..n {
                    let dx = positions[i].x - positions[j].x;
                    let dy = positions[i].y - positions[j].y;
                    let dist_sq = (dx * dx + dy * dy).max(EPSILON);
                    let dist = dist_sq.sqrt();
                    let push = config.repulsion / dist_sq;
                    forces[i].x += dx / dist * push;
                    forces[i].y += dy / dist * push;
                    forces[j].x -= dx / dist * push;
                    forces[j].y -= dy / dist * push;
                }
            }

            for &(i, j, ideal, strength) in &springs {
                let dx = positions[i].x - positions[j].x;
                let dy = positions[i].y - positions[j].y;
                let dist = (dx * dx + dy * dy).sqrt().max(EPSILON);
                let pull = strength * (dist - ideal);
                forces[i].x -= dx / dist * pull;
                forces[i].y -= dy / dist * pull;
                forces[j].x += dx / dist * pull;
                forces[j].y += dy / dist * pull;
            }

            let cooling = config.damping * (1.0 - step as f64 / config.iterations as f64);
            for (pos, force) in positions.iter_mut().zip(&forces) {
                let magnitude = (force.x * force.x + force.y * force.y).sqrt();
                let scale = if magnitude > config.max_step {
                    config.max_step / magnitude
                } else {
                    1.0
                };
                let mut next = Point {
                    x: pos.x + force.x * scale * cooling,
                    y: pos.y + force.y * scale * cooling,
                };
                next.x += (center.x - next.x) * config.center_pull;
                next.y += (center.y - next.y) * config.center_pull;
                *pos = config.canvas.clamp(next);
            }
        }

        let edges = graph
            .links()
            .iter()
            .map(|(key, rssi)| LayoutEdge {
                link: *key,
                rssi: *rssi,
                class: if backbone.contains(key) {
                    EdgeClass::Backbone
                } else {
                    EdgeClass::Secondary
                },
            })
            .collect();

        debug!(
            "Laid out {} nodes and {} springs over {} iterations",
            n,
            springs.len(),
            config.iterations
        );
        Self {
            positions: nodes.into_iter().zip(positions).collect(),
            edges,
        }
    }
}

fn initial_positions(count: usize, config: &LayoutConfig) -> Vec<Point> {
    let center = config.canvas.center();
    let mut rng = config.seed.map(StdRng::seed_from_u64);
    let jitter = config.jitter.abs();

    (0..count)
        .map(|i| {
            let angle = TAU * i as f64 / count as f64;
            let mut p = Point {
                x: center.x + config.radius * angle.cos(),
                y: center.y + config.radius * angle.sin(),
            };
            if let Some(rng) = rng.as_mut() {
                if jitter > 0.0 {
                    p.x += rng.gen_range(-jitter..=jitter);
                    p.y += rng.gen_range(-jitter..=jitter);
                }
            }
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::compute_backbone;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0xA4, 0xC1, 0x38, 0x00, 0x00, n])
    }

    fn sample_graph() -> TopologyGraph {
        let mut graph = TopologyGraph::new();
        let links = [
            (1, 2, -45.0),
            (2, 3, -55.0),
            (3, 4, -62.0),
            (1, 4, -88.0),
            (2, 5, -70.0),
            (1, 3, 4.0),
        ];
        for (x, y, rssi) in links {
            graph.insert_link(LinkKey::new(mac(x), mac(y)).unwrap(), rssi);
        }
        graph.add_node(mac(6));
        graph
    }

    #[test]
    fn test_rssi_to_distance() {
        assert!((rssi_to_distance(-30.0) - 315.478).abs() < 0.01);
        assert_eq!(rssi_to_distance(-10.0), rssi_to_distance(-30.0));
        assert_eq!(rssi_to_distance(-120.0), rssi_to_distance(-100.0));
        assert!(rssi_to_distance(-80.0) > rssi_to_distance(-50.0));
    }

    #[test]
    fn test_layout_is_finite_and_in_bounds() {
        let graph = sample_graph();
        let backbone = compute_backbone(&graph, false);
        let config = LayoutConfig {
            seed: Some(7),
            ..LayoutConfig::default()
        };

        let layout = Layout::compute(&graph, &backbone, &config);
        assert_eq!(layout.positions.len(), 6);
        for p in layout.positions.values() {
            assert!(p.x.is_finite() && p.y.is_finite());
            assert!(config.canvas.contains(*p));
        }

        assert_eq!(layout.edges.len(), graph.links().len());
        let backbone_edges = layout
            .edges
            .iter()
            .filter(|e| e.class == EdgeClass::Backbone)
            .count();
        assert_eq!(backbone_edges, backbone.len());
    }

    #[test]
    fn test_layout_is_deterministic_per_seed() {
        let graph = sample_graph();
        let backbone = compute_backbone(&graph, true);
        let seeded = |seed| LayoutConfig {
            seed: Some(seed),
            iterations: 300,
            ..LayoutConfig::default()
        };

        let a = Layout::compute(&graph, &backbone, &seeded(42));
        let b = Layout::compute(&graph, &backbone, &seeded(42));
        assert_eq!(a, b);

        let c = Layout::compute(&graph, &backbone, &seeded(43));
        assert_ne!(a.positions, c.positions);
    }

    #[test]
    fn test_coincident_nodes_stay_finite() {
        let mut graph = TopologyGraph::new();
        graph.insert_link(LinkKey::new(mac(1), mac(2)).unwrap(), -40.0);
        let config = LayoutConfig {
            radius: 0.0,
            iterations: 50,
            ..LayoutConfig::default()
        };

        let layout = Layout::compute(&graph, &BTreeSet::new(), &config);
        for p in layout.positions.values() {
            assert!(p.x.is_finite() && p.y.is_finite());
        }
    }

    #[test]
    fn test_empty_graph() {
        let layout = Layout::compute(&TopologyGraph::new(), &BTreeSet::new(), &LayoutConfig::default());
        assert!(layout.positions.is_empty());
        assert!(layout.edges.is_empty());
    }
}
