//! Connection session for one bulb.
//!
//! A [`Session`] owns the link, the device's [`NetworkState`] and a
//! background dispatcher that decodes notifications and hands each typed
//! response to the query waiting for its [`ResponseKind`]. Writes are
//! serialized per session; queries of the same kind are single-flight.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use mesh_storage::Registry;
use mesh_wire::{
    Chunker, ColorFrame, ColorReading, Command, CommandId, DeviceInfo, MacAddr, MeshNeighbor,
    NetworkState, Response, ResponseKind, Scene,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::SessionError;
use crate::transport::{BleConnector, BleLink, NotificationStream};

/// Timings for a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pause after each acknowledged write
    pub ack_settle: Duration,
    /// Pause between fragments
    pub chunk_interval: Duration,
    /// Pause after the last fragment
    pub chunk_settle: Duration,
    /// Pause between proxy sends
    pub proxy_interval: Duration,
    /// How long to wait for a color reply
    pub color_timeout: Duration,
    /// How long to wait for a device info reply
    pub device_info_timeout: Duration,
    /// Quiet period that ends a routing table read
    pub mesh_idle_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_settle: Duration::from_millis(100),
            chunk_interval: Duration::from_millis(50),
            chunk_settle: Duration::from_millis(500),
            proxy_interval: Duration::from_millis(100),
            color_timeout: Duration::from_secs(5),
            device_info_timeout: Duration::from_secs(10),
            mesh_idle_window: Duration::from_millis(1500),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Link being established
    Connecting,
    /// Subscribed and dispatching
    Ready,
}

type PendingTable = DashMap<ResponseKind, mpsc::UnboundedSender<Response>>;

/// Removes a pending registration when the query ends
struct PendingGuard<'a> {
    table: &'a PendingTable,
    kind: ResponseKind,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.kind);
    }
}

#[derive(Default)]
struct QueryLocks {
    color: Mutex<()>,
    device_info: Mutex<()>,
    mesh: Mutex<()>,
}

/// An open connection to one bulb
pub struct Session {
    address: MacAddr,
    link: Arc<dyn BleLink>,
    registry: Registry,
    config: SessionConfig,
    network: Mutex<NetworkState>,
    pub(crate) write_lock: Mutex<()>,
    pending: Arc<PendingTable>,
    queries: QueryLocks,
    state: Arc<watch::Sender<SessionState>>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect, subscribe and start dispatching notifications
    pub async fn open(
        connector: &dyn BleConnector,
        address: MacAddr,
        registry: Registry,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let state = Arc::new(watch::channel(SessionState::Connecting).0);
        debug!("Connecting to {}", address);

        let link = connector
            .connect(address)
            .await
            .map_err(SessionError::Connection)?;

        let stream = match link.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = link.disconnect().await;
                return Err(e.into());
            }
        };

        let network = match registry.network_state(&address).await {
            Ok(network) => network,
            Err(e) => {
                let _ = link.disconnect().await;
                return Err(e.into());
            }
        };
        let pending = Arc::new(PendingTable::new());

        state.send_replace(SessionState::Ready);
        let dispatcher = tokio::spawn(dispatch(address, stream, pending.clone(), state.clone()));
        info!("Session ready for {}", address);

        Ok(Self {
            address,
            link,
            registry,
            config,
            network: Mutex::new(network),
            write_lock: Mutex::new(()),
            pending,
            queries: QueryLocks::default(),
            state,
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        })
    }

    /// Address of the connected bulb
    pub fn address(&self) -> MacAddr {
        self.address
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Timings in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current network key and counter
    pub async fn network_state(&self) -> NetworkState {
        *self.network.lock().await
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            _ => Err(SessionError::NotReady),
        }
    }

    /// Unsubscribe, disconnect and stop the dispatcher
    pub async fn close(&self) {
        if self.state() == SessionState::Disconnected {
            return;
        }
        if let Err(e) = self.link.disconnect().await {
            warn!("Disconnect from {} failed: {}", self.address, e);
        }
        let handle = self
            .dispatcher
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.pending.clear();
        self.state.send_replace(SessionState::Disconnected);
        info!("Session closed for {}", self.address);
    }

    async fn persist_sequence(&self, state: &NetworkState) -> Result<(), SessionError> {
        self.registry
            .store_sequence(&self.address, state.seq_num)
            .await
            .map_err(SessionError::from)
    }

    /// Encode a command with a fresh envelope, persisting the counter.
    ///
    /// Caller holds `write_lock` until the packet is on the wire so envelopes
    /// leave in counter order.
    pub(crate) async fn build_packet(&self, command: &Command) -> Result<Bytes, SessionError> {
        let mut network = self.network.lock().await;
        let (_, packet) = command.build(&mut network)?;
        self.persist_sequence(&network).await?;
        Ok(packet)
    }

    /// Append a fresh envelope for `command` to `buf`, persisting the counter
    pub(crate) async fn pack_header(&self, command: CommandId, buf: &mut BytesMut) -> Result<(), SessionError> {
        let mut network = self.network.lock().await;
        network.pack(command, buf);
        self.persist_sequence(&network).await
    }

    async fn write_acked(&self, packet: &[u8]) -> Result<(), SessionError> {
        self.link.write(packet, true).await?;
        sleep(self.config.ack_settle).await;
        Ok(())
    }

    /// Acknowledged write
    pub async fn send_command(&self, packet: &[u8]) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        self.write_acked(packet).await
    }

    /// Unacknowledged write, returns as soon as the packet is queued
    pub async fn send_command_fast(&self, packet: &[u8]) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        self.link.write(packet, false).await?;
        Ok(())
    }

    /// Send a payload, fragmenting it when it exceeds one write
    pub async fn send_chunked(&self, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        self.send_chunked_locked(data).await
    }

    /// Caller holds `write_lock`
    pub(crate) async fn send_chunked_locked(&self, data: &[u8]) -> Result<(), SessionError> {
        if !Chunker::needs_chunking(data.len()) {
            return self.write_acked(data).await;
        }

        let fragments = Chunker::split(data)?;
        let count = fragments.len();
        for fragment in fragments {
            let mut buf = BytesMut::with_capacity(mesh_wire::ENVELOPE_SIZE + mesh_wire::chunk::FRAGMENT_SIZE);
            self.pack_header(CommandId::DataChunk, &mut buf).await?;
            fragment.encode(&mut buf);

            debug!(
                "Sending chunk {}/{} to {}",
                fragment.offset, fragment.total_length, self.address
            );
            self.link.write(&buf, true).await?;
            sleep(self.config.chunk_interval).await;
        }
        sleep(self.config.chunk_settle).await;

        debug!("Sent {} bytes in {} chunks to {}", data.len(), count, self.address);
        Ok(())
    }

    /// Build once and send directly or through the proxied targets
    async fn deliver(&self, command: &Command, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        let packet = self.build_packet(command).await?;
        match targets {
            Some(targets) if !targets.is_empty() => self.send_proxy_locked(targets, packet).await,
            _ => self.send_chunked_locked(&packet).await,
        }
    }

    fn register(&self, kind: ResponseKind) -> (PendingGuard<'_>, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(kind, tx);
        (
            PendingGuard {
                table: &self.pending,
                kind,
            },
            rx,
        )
    }

    /// Turn the bulb on
    pub async fn turn_on(&self, delay: u16, transit: u16, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        self.deliver(&Command::TurnOn { delay, transit }, targets).await
    }

    /// Turn the bulb off
    pub async fn turn_off(&self, delay: u16, transit: u16, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        self.deliver(&Command::TurnOff { delay, transit }, targets).await
    }

    /// Set a color and wait for the write acknowledgement
    pub async fn set_color(&self, color: ColorFrame, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        self.deliver(&Command::SetColorNeedResp(color), targets).await
    }

    /// Set a color without acknowledgement (streaming use)
    pub async fn set_color_fast(&self, color: ColorFrame, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        let command = Command::SetColor(color);
        match targets {
            Some(targets) if !targets.is_empty() => self.deliver(&command, Some(targets)).await,
            _ => {
                self.ensure_ready()?;
                let _guard = self.write_lock.lock().await;
                let packet = self.build_packet(&command).await?;
                self.link.write(&packet, false).await?;
                Ok(())
            }
        }
    }

    /// Fade to a color
    pub async fn set_color_smooth(
        &self,
        color: ColorFrame,
        duration_ms: u32,
        delay_sec: u32,
        targets: Option<&[MacAddr]>,
    ) -> Result<(), SessionError> {
        let command = Command::SetColorSmooth {
            color,
            duration_ms,
            delay_sec,
        };
        self.deliver(&command, targets).await
    }

    /// Flicker like a candle around a color
    pub async fn set_candle_mode(&self, color: ColorFrame, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        self.deliver(&Command::SetCandleMode(color), targets).await
    }

    /// Upload a scene
    pub async fn set_color_pattern(&self, scene: Scene, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        self.deliver(&Command::SetColorPattern(scene), targets).await
    }

    /// Play a stored scene
    pub async fn start_color_pattern(&self, scene_idx: u8, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        self.deliver(&Command::StartColorPattern(scene_idx), targets).await
    }

    /// Reboot into the bootloader using the configured key
    pub async fn enter_dfu_mode(&self, targets: Option<&[MacAddr]>) -> Result<(), SessionError> {
        let dfu_key = self.registry.dfu_key().await?;
        info!("Sending bootloader entry to {} with key {:#x}", self.address, dfu_key);
        self.deliver(&Command::EnterBootloader { dfu_key }, targets).await
    }

    /// Join a network.
    ///
    /// Sent directly, the new key is used for this command's own envelope and
    /// kept for the rest of the session; on failure the previous key is
    /// restored. The key, group and node ids are persisted on success.
    pub async fn commission(
        &self,
        network_key: u32,
        group_id: u16,
        node_id: u16,
        targets: Option<&[MacAddr]>,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let command = Command::Commission {
            network_key,
            group_id,
            node_id,
        };

        match targets {
            Some(targets) if !targets.is_empty() => {
                let _guard = self.write_lock.lock().await;
                let inner = {
                    let mut network = self.network.lock().await;
                    let mut rekeyed = NetworkState::new(network_key, network.seq_num);
                    let (_, inner) = command.build(&mut rekeyed)?;
                    network.seq_num = rekeyed.seq_num;
                    self.persist_sequence(&network).await?;
                    inner
                };
                self.send_proxy_locked(targets, inner).await?;
            }
            _ => {
                let _guard = self.write_lock.lock().await;
                let previous = {
                    let mut network = self.network.lock().await;
                    std::mem::replace(&mut network.network_key, network_key)
                };
                let sent = match self.build_packet(&command).await {
                    Ok(packet) => self.send_chunked_locked(&packet).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    self.network.lock().await.network_key = previous;
                    return Err(e);
                }
            }
        }

        self.registry
            .store_commission(network_key, group_id, node_id)
            .await?;
        info!(
            "Commissioned via {} (group {}, node {})",
            self.address, group_id, node_id
        );
        Ok(())
    }

    /// Read the current color; `None` when no reply arrives in time
    pub async fn get_bulb_color(&self, targets: Option<&[MacAddr]>) -> Result<Option<ColorReading>, SessionError> {
        let _single = self.queries.color.lock().await;
        let (_pending, mut rx) = self.register(ResponseKind::Color);

        self.deliver(&Command::GetBulbColor, targets).await?;

        match timeout(self.config.color_timeout, next_matching(&mut rx, |r| match r {
            Response::Color(c) => Some(c),
            _ => None,
        }))
        .await
        {
            Ok(color) => Ok(color),
            Err(_) => {
                warn!("Timeout waiting for color status from {}", self.address);
                Ok(None)
            }
        }
    }

    /// Read firmware and hardware details; `None` when no reply arrives in time
    pub async fn get_device_info(&self) -> Result<Option<DeviceInfo>, SessionError> {
        let _single = self.queries.device_info.lock().await;
        let (_pending, mut rx) = self.register(ResponseKind::DeviceInfo);

        self.deliver(&Command::GetDeviceInfo, None).await?;

        match timeout(self.config.device_info_timeout, next_matching(&mut rx, |r| match r {
            Response::DeviceInfo(info) => Some(info),
            _ => None,
        }))
        .await
        {
            Ok(info) => Ok(info),
            Err(_) => {
                warn!("Timed out waiting for device info from {}", self.address);
                Ok(None)
            }
        }
    }

    /// Read the routing table.
    ///
    /// Blocks are collected until none arrives within the idle window; the
    /// result may be empty.
    pub async fn get_mesh_info(&self) -> Result<Vec<MeshNeighbor>, SessionError> {
        let _single = self.queries.mesh.lock().await;
        let (_pending, mut rx) = self.register(ResponseKind::MeshNeighbors);

        self.deliver(&Command::QueryRouting, None).await?;

        let mut neighbors = Vec::new();
        loop {
            match timeout(self.config.mesh_idle_window, rx.recv()).await {
                Ok(Some(Response::MeshNeighbors(block))) => {
                    trace!("{} routing entries from {}", block.len(), self.address);
                    neighbors.extend(block);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        debug!("{} reports {} neighbors", self.address, neighbors.len());
        Ok(neighbors)
    }
}

async fn next_matching<T>(
    rx: &mut mpsc::UnboundedReceiver<Response>,
    pick: impl Fn(Response) -> Option<T>,
) -> Option<T> {
    while let Some(response) = rx.recv().await {
        if let Some(value) = pick(response) {
            return Some(value);
        }
    }
    None
}

async fn dispatch(
    address: MacAddr,
    mut stream: NotificationStream,
    pending: Arc<PendingTable>,
    state: Arc<watch::Sender<SessionState>>,
) {
    while let Some(packet) = stream.next().await {
        let response = match Response::decode(&packet) {
            Ok(response) => response,
            Err(e) => {
                debug!("Dropping malformed notification from {}: {}", address, e);
                continue;
            }
        };

        let Some(kind) = response.kind() else {
            trace!("Unsolicited notification from {}: {:?}", address, response);
            continue;
        };

        match pending.get(&kind) {
            Some(tx) => {
                if tx.send(response).is_err() {
                    trace!("{:?} reply from {} arrived after its query ended", kind, address);
                }
            }
            None => trace!("No pending {:?} query for notification from {}", kind, address),
        }
    }
    // Link lost; waiting queries see their channel close
    pending.clear();
    state.send_replace(SessionState::Disconnected);
    warn!("Notification stream for {} ended, session disconnected", address);
}
