//! Mesh proxy sends.
//!
//! The connected bulb forwards a wrapped command to one addressed bulb per
//! message. Several targets get one message each, paced by the session's
//! proxy interval.

use bytes::{Bytes, BytesMut};
use mesh_wire::{CommandId, MacAddr, ProxyEnvelope};
use tokio::time::sleep;
use tracing::debug;

use crate::error::SessionError;
use crate::session::Session;

impl Session {
    /// Forward an encoded command (envelope included) to each target.
    ///
    /// `inner` is reused as-is for every target; each proxy message gets its
    /// own PROXY_MSG envelope and goes through the fragment transport.
    pub async fn send_proxy(&self, targets: &[MacAddr], inner: Bytes) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        self.send_proxy_locked(targets, inner).await
    }

    /// Caller holds `write_lock`
    pub(crate) async fn send_proxy_locked(&self, targets: &[MacAddr], inner: Bytes) -> Result<(), SessionError> {
        for target in targets {
            let wrapped = ProxyEnvelope::new(*target, inner.clone());

            let mut buf = BytesMut::new();
            self.pack_header(CommandId::ProxyMsg, &mut buf).await?;
            wrapped.encode(&mut buf)?;

            debug!(
                "Proxying {} bytes to {} via {} (ttl {})",
                inner.len(),
                target,
                self.address(),
                wrapped.ttl()
            );
            self.send_chunked_locked(&buf).await?;
            sleep(self.config().proxy_interval).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::session::{Session, SessionConfig};
    use crate::testing::{delivered_payloads, mac, FakeConnector};
    use mesh_storage::{MemoryStore, Registry};
    use mesh_wire::{
        ColorFrame, CommandId, Scene, SceneFrame, ENVELOPE_SIZE, PROXY_HEADER_SIZE, TTL_LONG,
        TTL_SHORT,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    async fn open(connector: &FakeConnector) -> Session {
        let registry = Registry::new(Arc::new(MemoryStore::new()));
        Session::open(connector, mac(1), registry, SessionConfig::default())
            .await
            .unwrap()
    }

    fn proxy_body(payload: &[u8]) -> &[u8] {
        assert_eq!(payload[5], CommandId::ProxyMsg as u8);
        &payload[ENVELOPE_SIZE..]
    }

    #[tokio::test(start_paused = true)]
    async fn test_proxy_short_command_to_each_target() {
        let connector = FakeConnector::new();
        connector.add_bulb(mac(1));
        let session = open(&connector).await;

        let started = Instant::now();
        session
            .turn_on(0, 0, Some(&[mac(2), mac(3)]))
            .await
            .unwrap();
        // per target: 3 fragments, settle, proxy interval
        assert_eq!(
            started.elapsed(),
            Duration::from_millis(2 * (3 * 50 + 500 + 100))
        );

        let writes = connector.link(mac(1)).unwrap().writes();
        let payloads = delivered_payloads(&writes);
        assert_eq!(payloads.len(), 2);

        let first = proxy_body(&payloads[0]);
        let second = proxy_body(&payloads[1]);
        assert_eq!(first[0], TTL_SHORT);
        assert_eq!(first[1], 1);
        assert_eq!(u16::from_le_bytes([first[2], first[3]]), 16);
        assert_eq!(&first[4..10], &mac(2).to_wire());
        assert_eq!(&second[4..10], &mac(3).to_wire());

        // the inner command is built once
        let inner = &first[PROXY_HEADER_SIZE + 6..];
        assert_eq!(inner, &second[PROXY_HEADER_SIZE + 6..]);
        assert_eq!(inner.len(), 10);
        assert_eq!(inner[4], 0);
        assert_eq!(inner[5], CommandId::TurnOn as u8);

        assert_ne!(payloads[0][4], payloads[1][4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proxy_long_command_uses_long_ttl() {
        let connector = FakeConnector::new();
        connector.add_bulb(mac(1));
        let session = open(&connector).await;

        let scene = Scene {
            scene_idx: 0,
            repeatable: 255,
            start_now: true,
            frames: vec![SceneFrame::new(ColorFrame::new(0, 0, 255, 0, 128))],
        };
        session
            .set_color_pattern(scene, Some(&[mac(2)]))
            .await
            .unwrap();

        let payloads = delivered_payloads(&connector.link(mac(1)).unwrap().writes());
        assert_eq!(payloads.len(), 1);
        let body = proxy_body(&payloads[0]);
        assert_eq!(body[0], TTL_LONG);
        assert_eq!(body.len(), PROXY_HEADER_SIZE + 6 + 31);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proxied_color_reply() {
        let connector = FakeConnector::new();
        connector.set_responder(
            mac(1),
            Arc::new(|_: &[u8]| -> Vec<Vec<u8>> {
                vec![vec![28, 0, 12, 0, 0, 0, 0, 0, 6, 0, 16, 9, 8, 7, 6, 5]]
            }),
        );
        let session = open(&connector).await;

        let color = session
            .get_bulb_color(Some(&[mac(2)]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((color.r, color.g, color.b, color.w, color.brightness), (9, 8, 7, 6, 5));
    }
}
