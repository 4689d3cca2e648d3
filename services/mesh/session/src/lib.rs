//! BLE sessions with Ilumi bulbs.
//!
//! This crate drives the radio side of the protocol: one [`Session`] per
//! connected bulb, typed request/response dispatch over GATT notifications,
//! paced fragment and mesh proxy sends, multi-bulb fan-out through the
//! [`SessionManager`], and the breadth-first [`MeshCrawler`].
//!
//! ## Features
//!
//! - **Transport seam**: [`BleConnector`] / [`BleLink`] traits; the
//!   `native-ble` feature adds a btleplug backend in [`native`]
//! - **Sequence persistence**: every envelope's counter is written to the
//!   [`mesh_storage::Registry`] before the packet goes out
//! - **Queries**: color, device info and routing table reads, single-flight
//!   per kind, with timeouts that leave the session usable
//! - **Retry**: [`RetryPolicy`] for busy connects
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{BleConnector, Session, SessionConfig};
//! use mesh_storage::{MemoryStore, Registry};
//! use mesh_wire::ColorFrame;
//! use std::sync::Arc;
//!
//! # async fn example(connector: &dyn BleConnector) -> Result<(), mesh_session::SessionError> {
//! let registry = Registry::new(Arc::new(MemoryStore::new()));
//! let address = "A4:C1:38:12:34:56".parse().unwrap();
//!
//! let session = Session::open(connector, address, registry, SessionConfig::default()).await?;
//! session.set_color(ColorFrame::new(255, 120, 0, 0, 200), None).await?;
//! if let Some(color) = session.get_bulb_color(None).await? {
//!     println!("now showing {:?}", color);
//! }
//! session.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod crawler;
pub mod error;
pub mod manager;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod transport;

#[cfg(feature = "native-ble")]
pub mod native;

#[cfg(test)]
mod testing;

// Re-export main types
pub use crawler::{known_names, resolve_seeds, CrawlReport, MeshCrawler, NeighborProbe};
pub use error::SessionError;
pub use manager::{SessionManager, TargetOutcome, DEFAULT_MAX_CONNECTIONS};
pub use retry::{Backoff, RetryPolicy};
pub use session::{Session, SessionConfig, SessionState};
pub use transport::{
    is_ilumi_name, sort_by_signal, BleConnector, BleLink, DiscoveredBulb, NotificationStream,
    TransportError, ILUMI_API_CHAR_UUID, ILUMI_SERVICE_UUID,
};

#[cfg(feature = "native-ble")]
pub use native::NativeAdapter;
