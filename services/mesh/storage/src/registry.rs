//! Typed access to the persisted keys.

use crate::{ConfigStore, StorageError};
use mesh_wire::{MacAddr, NetworkState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Persisted key names
pub mod keys {
    /// Shared network key
    pub const NETWORK_KEY: &str = "network_key";
    /// Global sequence counter, used when a device has none of its own
    pub const SEQ_NUM: &str = "seq_num";
    /// Enrolled bulbs, keyed by MAC
    pub const BULBS: &str = "bulbs";
    /// Single-bulb setups from before multi-bulb support
    pub const LEGACY_MAC: &str = "mac_address";
    /// Bootloader unlock key
    pub const DFU_KEY: &str = "dfu_key";
    /// Group id from the last commission
    pub const GROUP_ID: &str = "group_id";
    /// Node id from the last commission
    pub const NODE_ID: &str = "node_id";

    /// Per-device sequence counter key
    pub fn seq_num_for(mac: &mesh_wire::MacAddr) -> String {
        format!("{}:{}", SEQ_NUM, mac)
    }
}

/// Bootloader key used when none is configured
pub const DEFAULT_DFU_KEY: u32 = 0x1234_5678;

/// One entry of the `bulbs` map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulbRecord {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Group label
    #[serde(default)]
    pub group: String,
    /// Mesh node id
    #[serde(default)]
    pub node_id: u16,
}

/// An enrolled bulb
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Physical address
    pub mac: MacAddr,
    /// Display name
    pub name: String,
    /// Group label
    pub group: String,
    /// Mesh node id
    pub node_id: u16,
}

impl DeviceIdentity {
    fn from_record(mac: MacAddr, record: BulbRecord) -> Self {
        Self {
            mac,
            name: record.name,
            group: record.group,
            node_id: record.node_id,
        }
    }
}

/// Which bulbs a command should reach.
///
/// Checked in order: `all`, `group`, `name`, `mac`; with nothing set every
/// enrolled bulb is chosen, then the legacy single address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSelector {
    /// Explicit address
    pub mac: Option<MacAddr>,
    /// Bulb name (case-insensitive)
    pub name: Option<String>,
    /// Group label (case-insensitive)
    pub group: Option<String>,
    /// Every enrolled bulb
    pub all: bool,
}

impl TargetSelector {
    /// Select one address
    pub fn mac(mac: MacAddr) -> Self {
        Self {
            mac: Some(mac),
            ..Self::default()
        }
    }

    /// Select every enrolled bulb
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }
}

/// Typed view over a [`ConfigStore`]
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn ConfigStore>,
}

impl Registry {
    /// Wrap a store
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Read and deserialize `key`, `default` when absent or null
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StorageError> {
        match self.store.get(key).await? {
            None | Some(Value::Null) => Ok(default),
            Some(value) => serde_json::from_value(value).map_err(|e| StorageError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Serialize and write `key`
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        self.store.set(key, serde_json::to_value(value)?).await
    }

    async fn bulb_map(&self) -> Result<BTreeMap<String, BulbRecord>, StorageError> {
        self.get_or(keys::BULBS, BTreeMap::new()).await
    }

    /// Every enrolled bulb, keyed by address
    pub async fn all_bulbs(&self) -> Result<BTreeMap<MacAddr, BulbRecord>, StorageError> {
        let raw = self.bulb_map().await?;
        let mut bulbs = BTreeMap::new();
        for (mac, record) in raw {
            match mac.parse::<MacAddr>() {
                Ok(addr) => {
                    bulbs.insert(addr, record);
                }
                Err(e) => warn!("Ignoring enrolled bulb with bad address: {}", e),
            }
        }
        Ok(bulbs)
    }

    /// Identity of an enrolled bulb
    pub async fn identity(&self, mac: &MacAddr) -> Result<Option<DeviceIdentity>, StorageError> {
        Ok(self
            .all_bulbs()
            .await?
            .remove(mac)
            .map(|record| DeviceIdentity::from_record(*mac, record)))
    }

    /// Display name for an address, falling back to its short suffix
    pub async fn display_name(&self, mac: &MacAddr) -> Result<String, StorageError> {
        Ok(match self.identity(mac).await? {
            Some(identity) if !identity.name.is_empty() => identity.name,
            _ => format!("Bulb_{}", mac.short_suffix()),
        })
    }

    /// One past the highest enrolled node id
    pub async fn next_node_id(&self) -> Result<u16, StorageError> {
        Ok(next_free_node(&self.bulb_map().await?))
    }

    /// Add or update a bulb. Without a node id the next free one is used.
    pub async fn add_bulb(
        &self,
        mac: MacAddr,
        name: &str,
        group: &str,
        node_id: Option<u16>,
    ) -> Result<u16, StorageError> {
        let mut bulbs = self.bulb_map().await?;

        let node_id = node_id.unwrap_or_else(|| next_free_node(&bulbs));

        bulbs.insert(
            mac.to_string(),
            BulbRecord {
                name: name.to_string(),
                group: group.to_string(),
                node_id,
            },
        );
        self.set(keys::BULBS, &bulbs).await?;

        debug!("Enrolled {} as '{}' (group '{}', node {})", mac, name, group, node_id);
        Ok(node_id)
    }

    /// Remove an enrolled bulb
    pub async fn remove_bulb(&self, mac: &MacAddr) -> Result<bool, StorageError> {
        let mut bulbs = self.bulb_map().await?;
        let before = bulbs.len();
        bulbs.retain(|k, _| k.parse::<MacAddr>().ok().as_ref() != Some(mac));
        if bulbs.len() == before {
            return Ok(false);
        }
        self.set(keys::BULBS, &bulbs).await?;
        Ok(true)
    }

    /// Bulb with a matching name (case-insensitive)
    pub async fn bulb_by_name(&self, name: &str) -> Result<Option<DeviceIdentity>, StorageError> {
        let wanted = name.to_lowercase();
        Ok(self
            .all_bulbs()
            .await?
            .into_iter()
            .find(|(_, b)| b.name.to_lowercase() == wanted)
            .map(|(mac, record)| DeviceIdentity::from_record(mac, record)))
    }

    /// Bulbs in a group (case-insensitive)
    pub async fn bulbs_in_group(&self, group: &str) -> Result<Vec<MacAddr>, StorageError> {
        let wanted = group.to_lowercase();
        Ok(self
            .all_bulbs()
            .await?
            .into_iter()
            .filter(|(_, b)| b.group.to_lowercase() == wanted)
            .map(|(mac, _)| mac)
            .collect())
    }

    /// Turn a selector into addresses
    pub async fn resolve_targets(&self, selector: &TargetSelector) -> Result<Vec<MacAddr>, StorageError> {
        if selector.all {
            return Ok(self.all_bulbs().await?.into_keys().collect());
        }

        if let Some(group) = &selector.group {
            return self.bulbs_in_group(group).await;
        }

        if let Some(name) = &selector.name {
            match self.bulb_by_name(name).await? {
                Some(identity) => return Ok(vec![identity.mac]),
                None => warn!("No bulb found with name '{}'", name),
            }
        }

        if let Some(mac) = selector.mac {
            return Ok(vec![mac]);
        }

        let bulbs = self.all_bulbs().await?;
        if !bulbs.is_empty() {
            return Ok(bulbs.into_keys().collect());
        }

        let legacy: Option<String> = self.get_or(keys::LEGACY_MAC, None).await?;
        match legacy.map(|m| m.parse::<MacAddr>()) {
            Some(Ok(mac)) => Ok(vec![mac]),
            Some(Err(e)) => {
                warn!("Ignoring legacy address: {}", e);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Shared network key (0 before commissioning)
    pub async fn network_key(&self) -> Result<u32, StorageError> {
        self.get_or(keys::NETWORK_KEY, 0u32).await
    }

    /// Key and sequence counter for a device
    pub async fn network_state(&self, mac: &MacAddr) -> Result<NetworkState, StorageError> {
        let network_key = self.network_key().await?;
        let seq_num = match self.get_or::<Option<u8>>(&keys::seq_num_for(mac), None).await? {
            Some(seq) => seq,
            None => self.get_or(keys::SEQ_NUM, 0u8).await?,
        };
        Ok(NetworkState::new(network_key, seq_num))
    }

    /// Persist a device's sequence counter
    pub async fn store_sequence(&self, mac: &MacAddr, seq_num: u8) -> Result<(), StorageError> {
        self.set(&keys::seq_num_for(mac), &seq_num).await
    }

    /// Bootloader unlock key
    pub async fn dfu_key(&self) -> Result<u32, StorageError> {
        self.get_or(keys::DFU_KEY, DEFAULT_DFU_KEY).await
    }

    /// Record the result of a successful commission
    pub async fn store_commission(
        &self,
        network_key: u32,
        group_id: u16,
        node_id: u16,
    ) -> Result<(), StorageError> {
        self.set(keys::NETWORK_KEY, &network_key).await?;
        self.set(keys::GROUP_ID, &group_id).await?;
        self.set(keys::NODE_ID, &node_id).await
    }
}

fn next_free_node(bulbs: &BTreeMap<String, BulbRecord>) -> u16 {
    bulbs
        .values()
        .map(|b| b.node_id)
        .max()
        .map_or(1, |max| max.saturating_add(1))
}
