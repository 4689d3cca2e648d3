//! Native BLE backend over btleplug.

use crate::transport::{
    is_ilumi_name, sort_by_signal, BleConnector, BleLink, DiscoveredBulb, NotificationStream,
    TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use mesh_wire::MacAddr;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SERVICE_UUID: Uuid = Uuid::from_u128(0xf000f0c0_0451_4000_b000_000000000000);
const API_CHAR_UUID: Uuid = Uuid::from_u128(0xf000f0c1_0451_4000_b000_000000000000);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Host BLE adapter
pub struct NativeAdapter {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl NativeAdapter {
    /// Open the named adapter, or the first one
    pub async fn new(adapter_name: Option<&str>, scan_timeout: Duration) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|err| TransportError::Adapter(format!("create BLE manager: {err}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|err| TransportError::Adapter(format!("enumerate BLE adapters: {err}")))?;

        let mut selected = None;
        for adapter in adapters {
            let Some(requested) = adapter_name else {
                selected = Some(adapter);
                break;
            };
            let info = adapter
                .adapter_info()
                .await
                .map_err(|err| TransportError::Adapter(format!("read adapter info: {err}")))?;
            if info.to_lowercase().contains(&requested.trim().to_lowercase()) {
                selected = Some(adapter);
                break;
            }
        }

        let adapter = selected.ok_or_else(|| match adapter_name {
            Some(name) => TransportError::Adapter(format!("configured adapter '{}' not found", name)),
            None => TransportError::Adapter("no BLE adapters available on host".to_string()),
        })?;

        info!("Using BLE adapter {:?}", adapter.adapter_info().await.ok());
        Ok(Self {
            adapter,
            scan_timeout,
        })
    }

    /// Scan until `address` shows up or the scan timeout passes
    async fn find_peripheral(&self, address: MacAddr) -> Result<Peripheral, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|err| TransportError::Scan(format!("start BLE scan: {err}")))?;

        let found = self.poll_for(address).await;
        if let Err(err) = self.adapter.stop_scan().await {
            debug!("stop scan: {}", err);
        }
        found
    }

    async fn poll_for(&self, address: MacAddr) -> Result<Peripheral, TransportError> {
        let deadline = Instant::now() + self.scan_timeout;
        loop {
            let peripherals = self
                .adapter
                .peripherals()
                .await
                .map_err(|err| TransportError::Scan(format!("list peripherals: {err}")))?;

            for peripheral in peripherals {
                if peripheral_address(&peripheral).await == Some(address) {
                    return Ok(peripheral);
                }
            }

            if Instant::now() >= deadline {
                return Err(TransportError::NotFound(address));
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }
    }
}

/// Run `release` when `result` failed; a failed release is only logged
async fn release_on_error<T, E, Fut>(
    result: Result<T, TransportError>,
    what: &str,
    release: impl FnOnce() -> Fut,
) -> Result<T, TransportError>
where
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    if result.is_err() {
        if let Err(err) = release().await {
            debug!("{}: {}", what, err);
        }
    }
    result
}

async fn peripheral_address(peripheral: &Peripheral) -> Option<MacAddr> {
    let properties = peripheral.properties().await.ok()??;
    properties.address.to_string().parse().ok()
}

#[async_trait]
impl BleConnector for NativeAdapter {
    async fn connect(&self, address: MacAddr) -> Result<Arc<dyn BleLink>, TransportError> {
        let peripheral = self.find_peripheral(address).await?;

        let connected = peripheral
            .is_connected()
            .await
            .map_err(|err| TransportError::connect(err.to_string()))?;
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|err| TransportError::connect(err.to_string()))?;
        }

        let setup = async {
            peripheral
                .discover_services()
                .await
                .map_err(|err| TransportError::connect(format!("discover GATT services: {err}")))?;
            peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == API_CHAR_UUID)
                .ok_or_else(|| TransportError::MissingCharacteristic(API_CHAR_UUID.to_string()))
        }
        .await;
        let characteristic =
            release_on_error(setup, "disconnect after failed setup", || peripheral.disconnect())
                .await?;

        info!("Connected to {}", address);
        Ok(Arc::new(NativeLink {
            address,
            peripheral,
            characteristic,
        }))
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredBulb>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|err| TransportError::Scan(format!("start BLE scan: {err}")))?;
        sleep(timeout).await;
        if let Err(err) = self.adapter.stop_scan().await {
            debug!("stop scan: {}", err);
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|err| TransportError::Scan(format!("list peripherals: {err}")))?;

        let mut found = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let advertises_service = properties.services.contains(&SERVICE_UUID);
            let named = properties.local_name.as_deref().is_some_and(is_ilumi_name);
            if !advertises_service && !named {
                continue;
            }
            match properties.address.to_string().parse::<MacAddr>() {
                Ok(address) => found.push(DiscoveredBulb {
                    address,
                    name: properties.local_name,
                    rssi: properties.rssi,
                }),
                Err(err) => warn!("Skipping bulb with unreadable address: {}", err),
            }
        }

        sort_by_signal(&mut found);
        debug!("Discovered {} bulbs", found.len());
        Ok(found)
    }
}

struct NativeLink {
    address: MacAddr,
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[async_trait]
impl BleLink for NativeLink {
    fn address(&self) -> MacAddr {
        self.address
    }

    async fn write(&self, data: &[u8], with_response: bool) -> Result<(), TransportError> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&self.characteristic, data, write_type)
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|err| TransportError::Subscribe(format!("open notification stream: {err}")))?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(|err| TransportError::Subscribe(err.to_string()))?;

        let uuid = self.characteristic.uuid;
        Ok(Box::pin(stream.filter_map(move |n| async move {
            (n.uuid == uuid).then(|| Bytes::from(n.value))
        })))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Err(err) = self.peripheral.unsubscribe(&self.characteristic).await {
            debug!("unsubscribe {}: {}", self.address, err);
        }
        self.peripheral
            .disconnect()
            .await
            .map_err(|err| TransportError::Adapter(format!("disconnect {}: {err}", self.address)))
    }
}
