//! BLE transport seam.
//!
//! Sessions talk to bulbs through [`BleLink`] (one connected bulb) obtained
//! from a [`BleConnector`] (the adapter). The native backend lives in
//! [`crate::native`] behind the `native-ble` feature; tests use a scripted
//! fake.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use mesh_wire::MacAddr;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Vendor GATT service
pub const ILUMI_SERVICE_UUID: &str = "f000f0c0-0451-4000-b000-000000000000";

/// Characteristic used for both writes and notifications
pub const ILUMI_API_CHAR_UUID: &str = "f000f0c1-0451-4000-b000-000000000000";

/// Raw notification payloads from one bulb
pub type NotificationStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Radio-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Adapter unavailable or misconfigured
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Scanning failed
    #[error("scan failed: {0}")]
    Scan(String),

    /// Device was not seen while scanning
    #[error("device {0} not found")]
    NotFound(MacAddr),

    /// Connection attempt failed
    #[error("connect failed: {message}")]
    Connect {
        /// The stack reported another operation in progress
        busy: bool,
        /// Stack error text
        message: String,
    },

    /// Characteristic missing on the device
    #[error("characteristic {0} not found")]
    MissingCharacteristic(String),

    /// Write rejected
    #[error("write failed: {0}")]
    Write(String),

    /// Subscribing to notifications failed
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Link already closed
    #[error("link closed")]
    Closed,
}

impl TransportError {
    /// Build a connect error, classifying "operation in progress" as busy
    pub fn connect(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let busy = lower.contains("inprogress") || lower.contains("in progress") || lower.contains("busy");
        TransportError::Connect { busy, message }
    }

    /// Whether retrying later may succeed
    pub fn is_busy(&self) -> bool {
        matches!(self, TransportError::Connect { busy: true, .. })
    }
}

/// A bulb seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredBulb {
    /// Device address
    pub address: MacAddr,
    /// Advertised name
    pub name: Option<String>,
    /// Signal strength of the last advertisement
    pub rssi: Option<i16>,
}

/// Whether an advertised name belongs to a bulb
pub fn is_ilumi_name(name: &str) -> bool {
    name.to_lowercase().contains("ilumi") || name.starts_with("L0")
}

/// Sort strongest first; unknown RSSI last
pub fn sort_by_signal(bulbs: &mut [DiscoveredBulb]) {
    bulbs.sort_by(|a, b| b.rssi.unwrap_or(i16::MIN).cmp(&a.rssi.unwrap_or(i16::MIN)));
}

/// One connected bulb
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Address of the connected bulb
    fn address(&self) -> MacAddr;

    /// Write to the API characteristic
    async fn write(&self, data: &[u8], with_response: bool) -> Result<(), TransportError>;

    /// Subscribe and return the notification stream (once per link)
    async fn notifications(&self) -> Result<NotificationStream, TransportError>;

    /// Unsubscribe and disconnect
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// The BLE adapter
#[async_trait]
pub trait BleConnector: Send + Sync {
    /// Connect to a bulb
    async fn connect(&self, address: MacAddr) -> Result<Arc<dyn BleLink>, TransportError>;

    /// Scan for bulbs for `timeout`, strongest first
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredBulb>, TransportError>;
}
