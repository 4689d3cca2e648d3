//! Topology of an Ilumi mesh as seen through routing table reads.
//!
//! Observations gathered by a crawl become a [`TopologyGraph`] of averaged
//! link strengths. From it the crate derives a strongest-path backbone and a
//! force-directed [`Layout`], and persists crawls as [`MeshSnapshot`] JSON.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backbone;
pub mod error;
pub mod graph;
pub mod layout;
pub mod snapshot;

// Re-export main types
pub use backbone::{compute_backbone, is_valid_rssi, MIN_VALID_RSSI};
pub use error::TopologyError;
pub use graph::{LinkKey, TopologyGraph};
pub use layout::{rssi_to_distance, Canvas, EdgeClass, Layout, LayoutConfig, LayoutEdge, Point};
pub use snapshot::{BulbObservation, MeshSnapshot};
