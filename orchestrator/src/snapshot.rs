//! Point-in-time view of a pool's inventory
//!
//! The coordinator reads pool, host, interface and storage attachment records
//! through [`PoolSnapshot`] when deciding ordering and clustering relevance.
//! Nothing here writes to the control plane.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

use crate::constants::storage::CLUSTERED_SR_TYPES;
use crate::errors::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub reference: String,
    pub name: String,
    /// Host reference of the pool coordinator
    pub coordinator: String,
    /// Whether the control plane offers the pool-level management switch
    #[serde(default)]
    pub supports_pool_management_reconfigure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub reference: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpMode {
    #[serde(rename = "DHCP")]
    Dhcp,
    Static,
    None,
}

impl IpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpMode::Dhcp => "DHCP",
            IpMode::Static => "Static",
            IpMode::None => "None",
        }
    }
}

/// A host's network attachment point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PifRecord {
    pub reference: String,
    pub host: String,
    pub network: String,
    pub device: String,
    pub ip_mode: IpMode,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub management: bool,
}

/// A host's attachment of a storage repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbdRecord {
    pub reference: String,
    pub host: String,
    pub sr: String,
    pub sr_type: String,
    pub currently_attached: bool,
}

impl PbdRecord {
    /// Storage served through the clustering service
    pub fn is_clustered(&self) -> bool {
        CLUSTERED_SR_TYPES
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&self.sr_type))
    }
}

/// Clustering service membership of one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHostRecord {
    pub reference: String,
    pub host: String,
    /// Interface the clustering service runs over
    pub pif: String,
    pub enabled: bool,
}

/// Read-only queries over the last known state of a pool
pub trait PoolSnapshot: Send + Sync {
    fn pool(&self) -> Option<PoolRecord>;
    fn host(&self, reference: &str) -> Option<HostRecord>;
    fn hosts(&self) -> Vec<HostRecord>;
    fn pif(&self, reference: &str) -> Option<PifRecord>;
    /// The interface on `host` attached to `network`
    fn pif_on(&self, network: &str, host: &str) -> Option<PifRecord>;
    fn pbd(&self, reference: &str) -> Option<PbdRecord>;
    fn pbds_on_host(&self, host: &str) -> Vec<PbdRecord>;
    fn cluster_host_on(&self, host: &str) -> Option<ClusterHostRecord>;
}

/// Supporters in stable order (name, then reference), coordinator last
pub fn ordered_hosts(snapshot: &dyn PoolSnapshot) -> Vec<HostRecord> {
    let coordinator = snapshot.pool().map(|p| p.coordinator);
    let mut supporters: Vec<HostRecord> = Vec::new();
    let mut last = None;

    for host in snapshot.hosts() {
        if Some(&host.reference) == coordinator.as_ref() {
            last = Some(host);
        } else {
            supporters.push(host);
        }
    }

    supporters.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.reference.cmp(&b.reference)));
    supporters.extend(last);
    supporters
}

/// Inventory records held in memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticSnapshot {
    #[serde(default)]
    pub pool: Option<PoolRecord>,
    #[serde(default)]
    pub hosts: Vec<HostRecord>,
    #[serde(default)]
    pub pifs: Vec<PifRecord>,
    #[serde(default)]
    pub pbds: Vec<PbdRecord>,
    #[serde(default)]
    pub cluster_hosts: Vec<ClusterHostRecord>,
}

impl PoolSnapshot for StaticSnapshot {
    fn pool(&self) -> Option<PoolRecord> {
        self.pool.clone()
    }

    fn host(&self, reference: &str) -> Option<HostRecord> {
        self.hosts.iter().find(|h| h.reference == reference).cloned()
    }

    fn hosts(&self) -> Vec<HostRecord> {
        self.hosts.clone()
    }

    fn pif(&self, reference: &str) -> Option<PifRecord> {
        self.pifs.iter().find(|p| p.reference == reference).cloned()
    }

    fn pif_on(&self, network: &str, host: &str) -> Option<PifRecord> {
        self.pifs
            .iter()
            .find(|p| p.network == network && p.host == host)
            .cloned()
    }

    fn pbd(&self, reference: &str) -> Option<PbdRecord> {
        self.pbds.iter().find(|p| p.reference == reference).cloned()
    }

    fn pbds_on_host(&self, host: &str) -> Vec<PbdRecord> {
        self.pbds.iter().filter(|p| p.host == host).cloned().collect()
    }

    fn cluster_host_on(&self, host: &str) -> Option<ClusterHostRecord> {
        self.cluster_hosts.iter().find(|c| c.host == host).cloned()
    }
}

/// Snapshot that can be swapped for a fresher one while operations read it
#[derive(Debug, Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<StaticSnapshot>>,
}

impl SharedSnapshot {
    pub fn new(snapshot: StaticSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn replace(&self, snapshot: StaticSnapshot) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Apply an in-place change, e.g. a refreshed attachment state
    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut StaticSnapshot),
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut *guard);
    }

    fn read<T>(&self, query: impl FnOnce(&StaticSnapshot) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        query(&*guard)
    }
}

impl PoolSnapshot for SharedSnapshot {
    fn pool(&self) -> Option<PoolRecord> {
        self.read(|s| s.pool())
    }

    fn host(&self, reference: &str) -> Option<HostRecord> {
        self.read(|s| s.host(reference))
    }

    fn hosts(&self) -> Vec<HostRecord> {
        self.read(|s| s.hosts())
    }

    fn pif(&self, reference: &str) -> Option<PifRecord> {
        self.read(|s| s.pif(reference))
    }

    fn pif_on(&self, network: &str, host: &str) -> Option<PifRecord> {
        self.read(|s| s.pif_on(network, host))
    }

    fn pbd(&self, reference: &str) -> Option<PbdRecord> {
        self.read(|s| s.pbd(reference))
    }

    fn pbds_on_host(&self, host: &str) -> Vec<PbdRecord> {
        self.read(|s| s.pbds_on_host(host))
    }

    fn cluster_host_on(&self, host: &str) -> Option<ClusterHostRecord> {
        self.read(|s| s.cluster_host_on(host))
    }
}

/// Where a fresh snapshot comes from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<StaticSnapshot, SessionError>;
}

#[async_trait]
impl SnapshotSource for StaticSnapshot {
    async fn fetch_snapshot(&self) -> Result<StaticSnapshot, SessionError> {
        Ok(self.clone())
    }
}

#[async_trait]
impl SnapshotSource for SharedSnapshot {
    async fn fetch_snapshot(&self) -> Result<StaticSnapshot, SessionError> {
        Ok(self.read(StaticSnapshot::clone))
    }
}
