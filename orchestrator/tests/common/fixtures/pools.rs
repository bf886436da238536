//! Pool snapshot builders

use orchestrator::snapshot::{
    ClusterHostRecord, HostRecord, IpMode, PbdRecord, PifRecord, PoolRecord, StaticSnapshot,
};

pub fn host(reference: &str) -> HostRecord {
    HostRecord {
        reference: reference.to_string(),
        name: format!("host-{}", reference),
    }
}

pub fn pif(reference: &str, host: &str, network: &str, ip: &str) -> PifRecord {
    PifRecord {
        reference: reference.to_string(),
        host: host.to_string(),
        network: network.to_string(),
        device: "eth1".to_string(),
        ip_mode: if ip.is_empty() {
            IpMode::None
        } else {
            IpMode::Static
        },
        ip: ip.to_string(),
        netmask: if ip.is_empty() {
            String::new()
        } else {
            "255.255.255.0".to_string()
        },
        gateway: String::new(),
        dns: String::new(),
        management: false,
    }
}

pub fn pbd(reference: &str, host: &str, sr_type: &str, attached: bool) -> PbdRecord {
    PbdRecord {
        reference: reference.to_string(),
        host: host.to_string(),
        sr: format!("sr-{}", reference),
        sr_type: sr_type.to_string(),
        currently_attached: attached,
    }
}

pub fn cluster_host(reference: &str, host: &str, pif: &str) -> ClusterHostRecord {
    ClusterHostRecord {
        reference: reference.to_string(),
        host: host.to_string(),
        pif: pif.to_string(),
        enabled: true,
    }
}

/// Builder for a pool snapshot with `h1` as coordinator
pub struct PoolBuilder {
    snapshot: StaticSnapshot,
}

impl PoolBuilder {
    pub fn new(hosts: &[&str]) -> Self {
        Self {
            snapshot: StaticSnapshot {
                pool: Some(PoolRecord {
                    reference: "pool-ref".to_string(),
                    name: "test-pool".to_string(),
                    coordinator: "h1".to_string(),
                    supports_pool_management_reconfigure: false,
                }),
                hosts: hosts.iter().map(|h| host(h)).collect(),
                ..Default::default()
            },
        }
    }

    pub fn coordinator(mut self, reference: &str) -> Self {
        if let Some(pool) = self.snapshot.pool.as_mut() {
            pool.coordinator = reference.to_string();
        }
        self
    }

    pub fn pool_management_reconfigure(mut self, supported: bool) -> Self {
        if let Some(pool) = self.snapshot.pool.as_mut() {
            pool.supports_pool_management_reconfigure = supported;
        }
        self
    }

    pub fn pif(mut self, reference: &str, host: &str, network: &str, ip: &str) -> Self {
        self.snapshot.pifs.push(pif(reference, host, network, ip));
        self
    }

    pub fn management_pif(mut self, reference: &str, host: &str, network: &str, ip: &str) -> Self {
        let mut record = pif(reference, host, network, ip);
        record.management = true;
        self.snapshot.pifs.push(record);
        self
    }

    pub fn pbd(mut self, reference: &str, host: &str, sr_type: &str, attached: bool) -> Self {
        self.snapshot.pbds.push(pbd(reference, host, sr_type, attached));
        self
    }

    pub fn cluster_host(mut self, reference: &str, host: &str, pif: &str) -> Self {
        self.snapshot
            .cluster_hosts
            .push(cluster_host(reference, host, pif));
        self
    }

    pub fn build(self) -> StaticSnapshot {
        self.snapshot
    }
}

/// Management on network A, a new network B, on hosts h1 (coordinator) and h2
pub fn two_host_management_pool() -> PoolBuilder {
    PoolBuilder::new(&["h1", "h2"])
        .management_pif("a1", "h1", "net-a", "10.0.0.1")
        .management_pif("a2", "h2", "net-a", "10.0.0.2")
        .pif("b1", "h1", "net-b", "10.0.1.1")
        .pif("b2", "h2", "net-b", "10.0.1.2")
}
