//! Scripted BLE fakes for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use mesh_wire::{CommandId, MacAddr, ENVELOPE_SIZE};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::{
    sort_by_signal, BleConnector, BleLink, DiscoveredBulb, NotificationStream, TransportError,
};

/// Produces notifications for a written packet
pub(crate) type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

pub(crate) fn mac(n: u8) -> MacAddr {
    MacAddr([0xA4, 0xC1, 0x38, 0x00, 0x00, n])
}

/// Command id of a written packet
pub(crate) fn command_of(packet: &[u8]) -> Option<u8> {
    packet.get(ENVELOPE_SIZE - 1).copied()
}

/// A QUERY_ROUTING notification
pub(crate) fn routing_block(entries: &[(MacAddr, i8)]) -> Vec<u8> {
    let size = (entries.len() * 8) as u16;
    let mut out = vec![CommandId::QueryRouting as u8, 0];
    out.extend_from_slice(&size.to_le_bytes());
    for (addr, rssi) in entries {
        out.extend_from_slice(&addr.to_wire());
        out.push(1);
        out.push(*rssi as u8);
    }
    out
}

/// Responds to QUERY_ROUTING with one block per chunk of `per_block` entries
pub(crate) fn mesh_responder(entries: Vec<(MacAddr, i8)>, per_block: usize) -> Responder {
    Arc::new(move |packet: &[u8]| -> Vec<Vec<u8>> {
        if command_of(packet) != Some(CommandId::QueryRouting as u8) {
            return Vec::new();
        }
        entries
            .chunks(per_block.max(1))
            .map(routing_block)
            .collect()
    })
}

pub(crate) struct FakeLink {
    address: MacAddr,
    writes: Mutex<Vec<(Vec<u8>, bool)>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    responder: Responder,
    fail_writes: AtomicBool,
    accept_writes: AtomicUsize,
    disconnected: AtomicBool,
}

impl FakeLink {
    pub(crate) fn new(address: MacAddr, responder: Responder) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            address,
            writes: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(Some(notify_tx)),
            notify_rx: Mutex::new(Some(notify_rx)),
            responder,
            fail_writes: AtomicBool::new(false),
            accept_writes: AtomicUsize::new(usize::MAX),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Every write so far with its acknowledged flag
    pub(crate) fn writes(&self) -> Vec<(Vec<u8>, bool)> {
        self.writes.lock().unwrap().clone()
    }

    /// Push a notification as if the bulb sent it
    pub(crate) fn notify(&self, data: &[u8]) {
        if let Some(tx) = self.notify_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
    }

    /// End the notification stream as a dropped link would
    pub(crate) fn end_notifications(&self) {
        self.notify_tx.lock().unwrap().take();
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reject every write once `total` writes have been recorded
    pub(crate) fn fail_after_writes(&self, total: usize) {
        self.accept_writes.store(total, Ordering::SeqCst);
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleLink for FakeLink {
    fn address(&self) -> MacAddr {
        self.address
    }

    async fn write(&self, data: &[u8], with_response: bool) -> Result<(), TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Closed);
        }
        {
            let mut writes = self.writes.lock().unwrap();
            if self.fail_writes.load(Ordering::SeqCst)
                || writes.len() >= self.accept_writes.load(Ordering::SeqCst)
            {
                return Err(TransportError::Write("rejected".to_string()));
            }
            writes.push((data.to_vec(), with_response));
        }
        for reply in (self.responder)(data) {
            self.notify(&reply);
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let rx = self
            .notify_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Subscribe("already subscribed".to_string()))?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|b| (b, rx))
        })))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    responders: DashMap<MacAddr, Responder>,
    links: DashMap<MacAddr, Arc<FakeLink>>,
    busy: DashMap<MacAddr, u32>,
    attempts: DashMap<MacAddr, usize>,
    rejecting: DashSet<MacAddr>,
    advertised: Mutex<Vec<DiscoveredBulb>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make a bulb connectable, silent on every write
    pub(crate) fn add_bulb(&self, address: MacAddr) {
        self.set_responder(address, Arc::new(|_: &[u8]| -> Vec<Vec<u8>> { Vec::new() }));
    }

    pub(crate) fn set_responder(&self, address: MacAddr, responder: Responder) {
        self.responders.insert(address, responder);
    }

    /// Fail the next `times` connects to `address` as busy
    pub(crate) fn fail_busy(&self, address: MacAddr, times: u32) {
        self.busy.insert(address, times);
    }

    /// Links to `address` reject every write
    pub(crate) fn reject_writes(&self, address: MacAddr) {
        self.rejecting.insert(address);
    }

    pub(crate) fn advertise(&self, bulb: DiscoveredBulb) {
        self.advertised.lock().unwrap().push(bulb);
    }

    /// Most recent link to `address`
    pub(crate) fn link(&self, address: MacAddr) -> Option<Arc<FakeLink>> {
        self.links.get(&address).map(|l| l.clone())
    }

    pub(crate) fn connect_attempts(&self, address: MacAddr) -> usize {
        self.attempts.get(&address).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl BleConnector for FakeConnector {
    async fn connect(&self, address: MacAddr) -> Result<Arc<dyn BleLink>, TransportError> {
        *self.attempts.entry(address).or_insert(0) += 1;

        if let Some(mut remaining) = self.busy.get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::connect("org.bluez.Error.InProgress"));
            }
        }

        let responder = self
            .responders
            .get(&address)
            .map(|r| r.clone())
            .ok_or(TransportError::NotFound(address))?;

        let link = Arc::new(FakeLink::new(address, responder));
        if self.rejecting.contains(&address) {
            link.set_fail_writes(true);
        }
        self.links.insert(address, link.clone());
        Ok(link)
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredBulb>, TransportError> {
        tokio::time::sleep(timeout).await;
        let mut found = self.advertised.lock().unwrap().clone();
        sort_by_signal(&mut found);
        Ok(found)
    }
}

/// Payloads as the bulb would see them: fragments reassembled, other writes as-is
pub(crate) fn delivered_payloads(writes: &[(Vec<u8>, bool)]) -> Vec<Vec<u8>> {
    let mut reassembler = mesh_wire::Reassembler::new();
    let mut out = Vec::new();
    for (packet, _) in writes {
        if command_of(packet) == Some(CommandId::DataChunk as u8) {
            let mut body = &packet[ENVELOPE_SIZE..];
            let fragment = mesh_wire::Fragment::decode(&mut body).unwrap();
            if let Some(payload) = reassembler.push(fragment) {
                out.push(payload.to_vec());
            }
        } else {
            out.push(packet.clone());
        }
    }
    out
}
