//! Session manager: the shared adapter handle and multi-bulb fan-out.
//!
//! The manager owns the [`BleConnector`] and the [`Registry`] and bounds how
//! many bulbs are worked on at once. Per-bulb failures are collected, never
//! propagated, so one unreachable bulb does not abort a batch.

use futures::future::join_all;
use mesh_storage::Registry;
use mesh_wire::{ColorFrame, MacAddr};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionConfig};
use crate::transport::{BleConnector, DiscoveredBulb};

/// Default number of bulbs worked on concurrently
pub const DEFAULT_MAX_CONNECTIONS: usize = 2;

const ENROLL_FLASH: Duration = Duration::from_millis(500);

/// Result of an operation on one bulb
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetOutcome {
    /// Operation completed
    pub success: bool,
    /// Error text when it did not
    pub error: Option<String>,
}

impl TargetOutcome {
    fn from_result(result: Result<(), SessionError>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                error: None,
            },
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Opens sessions and fans operations out across bulbs
pub struct SessionManager {
    connector: Arc<dyn BleConnector>,
    registry: Registry,
    config: SessionConfig,
    connect_retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl SessionManager {
    /// Create a manager allowing `max_connections` bulbs at once
    pub fn new(
        connector: Arc<dyn BleConnector>,
        registry: Registry,
        config: SessionConfig,
        max_connections: usize,
    ) -> Self {
        Self {
            connector,
            registry,
            config,
            connect_retry: RetryPolicy::none(),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    /// Retry busy connection attempts with `policy`
    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    /// Persisted state
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Session timings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session, retrying busy connects per the manager's policy
    pub async fn open(&self, address: MacAddr) -> Result<Session, SessionError> {
        let what = format!("connect to {}", address);
        self.connect_retry
            .run(
                &what,
                || {
                    Session::open(
                        self.connector.as_ref(),
                        address,
                        self.registry.clone(),
                        self.config.clone(),
                    )
                },
                SessionError::is_transient,
            )
            .await
    }

    /// Scan for bulbs
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredBulb>, SessionError> {
        self.connector
            .discover(timeout)
            .await
            .map_err(SessionError::Transport)
    }

    /// Commission a bulb and enroll it under `name` and `group`.
    ///
    /// The bulb flashes green, is commissioned, flashes blue and turns off.
    /// Nothing is stored unless the commission write succeeds.
    pub async fn enroll(
        &self,
        address: MacAddr,
        name: &str,
        group: &str,
        node_id: Option<u16>,
        group_id: u16,
        network_key: u32,
    ) -> Result<u16, SessionError> {
        let node_id = match node_id {
            Some(id) => id,
            None => self.registry.next_node_id().await?,
        };

        let session = self.open(address).await?;
        let commissioned = async {
            session
                .set_color_fast(ColorFrame::new(0, 255, 0, 0, 255), None)
                .await?;
            session.commission(network_key, group_id, node_id, None).await
        }
        .await;

        if commissioned.is_ok() {
            let confirm = async {
                session
                    .set_color_fast(ColorFrame::new(0, 100, 255, 0, 255), None)
                    .await?;
                sleep(ENROLL_FLASH).await;
                session.set_color_fast(ColorFrame::default(), None).await
            }
            .await;
            if let Err(e) = confirm {
                warn!("[{}] Confirmation flash failed: {}", address, e);
            }
        }
        session.close().await;
        commissioned?;

        self.registry
            .add_bulb(address, name, group, Some(node_id))
            .await?;
        info!("Enrolled {} as '{}' (node {})", address, name, node_id);
        Ok(node_id)
    }

    /// Run `op` against each target on its own session.
    ///
    /// At most `max_connections` targets are in flight; every target gets an
    /// outcome.
    pub async fn execute_on_targets<F, Fut>(
        &self,
        targets: &[MacAddr],
        op: F,
    ) -> BTreeMap<MacAddr, TargetOutcome>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let op = &op;
        let runs = targets.iter().map(|&address| async move {
            let _permit = match self.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        address,
                        TargetOutcome::from_result(Err(SessionError::NotReady)),
                    )
                }
            };

            let result = match self.open(address).await {
                Ok(session) => {
                    let session = Arc::new(session);
                    let result = op(session.clone()).await;
                    session.close().await;
                    result
                }
                Err(e) => Err(e),
            };

            if let Err(e) = &result {
                warn!("[{}] Error: {}", address, e);
            } else {
                debug!("[{}] done", address);
            }
            (address, TargetOutcome::from_result(result))
        });

        let results: BTreeMap<_, _> = join_all(runs).await.into_iter().collect();
        let failed = results.values().filter(|o| !o.success).count();
        info!(
            "Executed on {} targets ({} failed)",
            results.len(),
            failed
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mac, FakeConnector};
    use mesh_storage::MemoryStore;
    use mesh_wire::CommandId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(connector: Arc<FakeConnector>, max: usize) -> SessionManager {
        SessionManager::new(
            connector,
            Registry::new(Arc::new(MemoryStore::new())),
            SessionConfig::default(),
            max,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_on_targets_collects_failures() {
        let connector = Arc::new(FakeConnector::new());
        connector.add_bulb(mac(1));
        connector.add_bulb(mac(3));
        let manager = manager(connector.clone(), 2);

        let results = manager
            .execute_on_targets(&[mac(1), mac(2), mac(3)], |session| async move {
                session.set_color(ColorFrame::new(255, 0, 0, 0, 255), None).await
            })
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[&mac(1)].success);
        assert!(!results[&mac(2)].success);
        assert!(results[&mac(2)].error.as_deref().unwrap_or("").contains("connection failed"));
        assert!(results[&mac(3)].success);

        assert_eq!(connector.link(mac(1)).unwrap().writes().len(), 1);
        assert!(connector.link(mac(1)).unwrap().is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_on_targets_respects_limit() {
        let connector = Arc::new(FakeConnector::new());
        for i in 1..=5 {
            connector.add_bulb(mac(i));
        }
        let manager = manager(connector, 2);

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let targets: Vec<_> = (1..=5).map(mac).collect();

        let results = manager
            .execute_on_targets(&targets, |session| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let result = session.turn_on(0, 0, None).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    result
                }
            })
            .await;

        assert!(results.values().all(|o| o.success));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enroll_stores_bulb_after_commission() {
        let connector = Arc::new(FakeConnector::new());
        connector.add_bulb(mac(1));
        let manager = manager(connector.clone(), 1);
        manager
            .registry()
            .add_bulb(mac(5), "Porch", "outside", Some(3))
            .await
            .unwrap();

        let node_id = manager
            .enroll(mac(1), "Desk", "office", None, 1, 4242)
            .await
            .unwrap();
        assert_eq!(node_id, 4);

        let commands: Vec<u8> = connector
            .link(mac(1))
            .unwrap()
            .writes()
            .iter()
            .map(|(w, _)| w[5])
            .collect();
        assert_eq!(
            commands,
            vec![
                CommandId::SetColor as u8,
                CommandId::CommissionWithId as u8,
                CommandId::SetColor as u8,
                CommandId::SetColor as u8,
            ]
        );

        let bulbs = manager.registry().all_bulbs().await.unwrap();
        assert_eq!(bulbs[&mac(1)].node_id, 4);
        assert_eq!(bulbs[&mac(1)].group, "office");
        assert_eq!(manager.registry().network_key().await.unwrap(), 4242);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_enroll_stores_nothing() {
        let connector = Arc::new(FakeConnector::new());
        connector.add_bulb(mac(2));
        connector.reject_writes(mac(2));
        let manager = manager(connector, 1);

        assert!(matches!(
            manager.enroll(mac(2), "Lamp", "office", None, 1, 4242).await,
            Err(SessionError::Transport(_))
        ));
        assert!(matches!(
            manager.enroll(mac(9), "Gone", "office", None, 1, 4242).await,
            Err(SessionError::Connection(_))
        ));

        assert!(manager.registry().all_bulbs().await.unwrap().is_empty());
        assert_eq!(manager.registry().network_key().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_retries_busy_connect() {
        let connector = Arc::new(FakeConnector::new());
        connector.add_bulb(mac(1));
        connector.fail_busy(mac(1), 2);

        let manager = manager(connector.clone(), 1).with_connect_retry(RetryPolicy::default());
        let session = manager.open(mac(1)).await.unwrap();
        assert_eq!(connector.connect_attempts(mac(1)), 3);
        session.close().await;

        connector.fail_busy(mac(1), 3);
        assert!(manager.open(mac(1)).await.is_err());
    }
}
