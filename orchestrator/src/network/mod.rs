//! Coordinated network reconfiguration
//!
//! A [`NetworkChangeRequest`] names interfaces to bring up, interfaces to
//! bring down and an optional management interface move. The request is
//! resolved against a [`PoolSnapshot`] into a [`NetworkPlan`]: for pool-wide
//! changes every interface expands to its sibling on each host, supporters
//! first and the coordinator last.

pub mod coordinator;

pub use coordinator::NetworkReconfiguration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::OperationError;
use crate::snapshot::{ordered_hosts, HostRecord, PifRecord, PoolSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkScope {
    SingleHost { host: String },
    Pool,
}

/// Move of the management role from `old` to `new` (interface references)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementChange {
    pub new: String,
    pub old: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkChangeRequest {
    /// Interfaces to configure with their snapshot IP configuration
    #[serde(default)]
    pub bring_up: Vec<String>,
    /// Interfaces to deconfigure
    #[serde(default)]
    pub bring_down: Vec<String>,
    #[serde(default)]
    pub management: Option<ManagementChange>,
    pub scope: NetworkScope,
    /// The management address itself changes, so losing the control plane is expected
    #[serde(default)]
    pub management_address_changed: bool,
}

impl NetworkChangeRequest {
    pub fn is_pool_wide(&self) -> bool {
        self.scope == NetworkScope::Pool
    }
}

/// One interface change on one host
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub host: HostRecord,
    pub pif: PifRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagementStep {
    pub host: HostRecord,
    pub new_pif: PifRecord,
    pub old_pif: Option<PifRecord>,
    /// Deconfigure the old address once the role has moved
    pub clear_old_address: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagementPlan {
    pub new: PifRecord,
    pub old: PifRecord,
    pub steps: Vec<ManagementStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPlan {
    pub pool_wide: bool,
    pub hosts: Vec<HostRecord>,
    /// Per requested interface, one change per host in host order
    pub bring_up: Vec<Vec<PlannedChange>>,
    pub management: Option<ManagementPlan>,
    pub bring_down: Vec<Vec<PlannedChange>>,
}

impl NetworkPlan {
    pub fn resolve(
        request: &NetworkChangeRequest,
        snapshot: &dyn PoolSnapshot,
    ) -> Result<Self, OperationError> {
        let hosts = match &request.scope {
            NetworkScope::Pool => {
                let hosts = ordered_hosts(snapshot);
                if hosts.is_empty() {
                    return Err(OperationError::precondition("pool has no hosts"));
                }
                hosts
            }
            NetworkScope::SingleHost { host } => vec![snapshot
                .host(host)
                .ok_or_else(|| OperationError::precondition(format!("unknown host {}", host)))?],
        };

        let bring_up = request
            .bring_up
            .iter()
            .map(|pif| expand(snapshot, &hosts, pif, request.is_pool_wide()))
            .collect::<Result<Vec<_>, _>>()?;

        let bring_down = request
            .bring_down
            .iter()
            .map(|pif| expand(snapshot, &hosts, pif, request.is_pool_wide()))
            .collect::<Result<Vec<_>, _>>()?;

        let management = match &request.management {
            Some(change) => Some(plan_management(
                snapshot,
                &hosts,
                change,
                &bring_up,
                &bring_down,
            )?),
            None => None,
        };

        Ok(Self {
            pool_wide: request.is_pool_wide(),
            hosts,
            bring_up,
            management,
            bring_down,
        })
    }

    /// Host-level steps across every phase
    pub fn total_steps(&self) -> usize {
        let up: usize = self.bring_up.iter().map(Vec::len).sum();
        let down: usize = self.bring_down.iter().map(Vec::len).sum();
        let management = self.management.as_ref().map_or(0, |m| m.steps.len());
        up + management + down
    }

    pub fn changes(&self) -> impl Iterator<Item = &PlannedChange> {
        self.bring_up.iter().chain(self.bring_down.iter()).flatten()
    }
}

fn lookup_pif(snapshot: &dyn PoolSnapshot, reference: &str) -> Result<PifRecord, OperationError> {
    snapshot
        .pif(reference)
        .ok_or_else(|| OperationError::precondition(format!("unknown interface {}", reference)))
}

/// The referenced interface's counterpart on every host in order
fn expand(
    snapshot: &dyn PoolSnapshot,
    hosts: &[HostRecord],
    reference: &str,
    pool_wide: bool,
) -> Result<Vec<PlannedChange>, OperationError> {
    let pif = lookup_pif(snapshot, reference)?;

    if !pool_wide {
        let host = hosts
            .first()
            .ok_or_else(|| OperationError::precondition("no target host"))?;
        if pif.host != host.reference {
            return Err(OperationError::precondition(format!(
                "interface {} is not on host {}",
                reference, host.name
            )));
        }
        return Ok(vec![PlannedChange {
            host: host.clone(),
            pif,
        }]);
    }

    let mut changes = Vec::with_capacity(hosts.len());
    for host in hosts {
        match snapshot.pif_on(&pif.network, &host.reference) {
            Some(sibling) => changes.push(PlannedChange {
                host: host.clone(),
                pif: sibling,
            }),
            None => debug!("Host {} has no interface on network {}", host.name, pif.network),
        }
    }
    Ok(changes)
}

fn plan_management(
    snapshot: &dyn PoolSnapshot,
    hosts: &[HostRecord],
    change: &ManagementChange,
    bring_up: &[Vec<PlannedChange>],
    bring_down: &[Vec<PlannedChange>],
) -> Result<ManagementPlan, OperationError> {
    let new = lookup_pif(snapshot, &change.new)?;
    let old = lookup_pif(snapshot, &change.old)?;

    let mut steps = Vec::with_capacity(hosts.len());
    for host in hosts {
        let new_pif = snapshot
            .pif_on(&new.network, &host.reference)
            .ok_or_else(|| {
                OperationError::precondition(format!(
                    "host {} has no interface on the new management network",
                    host.name
                ))
            })?;
        let old_pif = snapshot.pif_on(&old.network, &host.reference);

        // Keep the old address when an interface brought up on this host
        // reuses it; skip it when the old interface is brought down anyway
        let clear_old_address = match &old_pif {
            Some(old_pif) if old_pif.reference != new_pif.reference && !old_pif.ip.is_empty() => {
                let reused = bring_up
                    .iter()
                    .flatten()
                    .any(|c| c.host.reference == host.reference && c.pif.ip == old_pif.ip);
                let brought_down = bring_down
                    .iter()
                    .flatten()
                    .any(|c| c.pif.reference == old_pif.reference);
                !reused && !brought_down
            }
            _ => false,
        };

        steps.push(ManagementStep {
            host: host.clone(),
            new_pif,
            old_pif,
            clear_old_address,
        });
    }

    Ok(ManagementPlan { new, old, steps })
}
