// Per-user device quota reconciliation

//! Quota reconciliation
//!
//! Groups each user's flows by source address (one address is one device)
//! and decides which devices to evict when a user has more devices connected
//! than their quota allows.
//!
//! Devices are kept in ascending address order: the first `max_devices`
//! addresses survive and every flow of the remaining addresses is evicted.
//! The order is deterministic so the same snapshot always yields the same
//! eviction set.

use crate::conntrack::Snapshot;
use crate::registry::{QuotaError, QuotaRow};
use crate::types::{ConnectionRecord, UserQuota};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Records to tear down in one cycle
pub type EvictionSet = BTreeSet<ConnectionRecord>;

/// All flows from one source address to one port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroup {
    /// Device address
    pub source: IpAddr,
    /// The device's flows, in snapshot order
    pub records: Vec<ConnectionRecord>,
}

/// A user found over quota, with the devices kept and evicted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBreach {
    /// User over quota
    pub username: String,
    /// Port the devices were counted on
    pub port: u16,
    /// The user's device limit
    pub max_devices: u32,
    /// Devices allowed to stay, in address order
    pub kept: Vec<IpAddr>,
    /// Devices whose flows are torn down
    pub evicted: Vec<IpAddr>,
}

impl QuotaBreach {
    /// Devices seen before eviction
    pub fn devices(&self) -> usize {
        self.kept.len() + self.evicted.len()
    }
}

/// Result of reconciling one snapshot against all quotas
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Every record to tear down, across all users
    pub evictions: EvictionSet,
    /// One entry per user over quota
    pub breaches: Vec<QuotaBreach>,
}

/// Group the snapshot's flows on `port` by source address, in address order
pub fn device_groups(snapshot: &Snapshot, port: u16) -> Vec<DeviceGroup> {
    let mut groups: BTreeMap<IpAddr, Vec<ConnectionRecord>> = BTreeMap::new();
    for record in snapshot.on_port(port) {
        groups.entry(record.source).or_default().push(*record);
    }

    groups
        .into_iter()
        .map(|(source, records)| DeviceGroup { source, records })
        .collect()
}

/// Check one user; returns the breach and the records to evict, if over quota
pub fn reconcile_user(
    snapshot: &Snapshot,
    quota: &UserQuota,
    fallback_port: u16,
) -> Option<(QuotaBreach, Vec<ConnectionRecord>)> {
    let port = quota.effective_port(fallback_port);
    let groups = device_groups(snapshot, port);
    let max_devices = quota.max_devices as usize;

    if groups.len() <= max_devices {
        return None;
    }

    log::info!(
        "Limit exceeded for {} (port {}): {} devices, max {}",
        quota.username,
        port,
        groups.len(),
        quota.max_devices
    );

    let mut kept = Vec::with_capacity(max_devices);
    let mut evicted = Vec::with_capacity(groups.len() - max_devices);
    let mut records = Vec::new();

    for (index, group) in groups.into_iter().enumerate() {
        if index < max_devices {
            kept.push(group.source);
        } else {
            log::info!("  Evicting excess device {} for {}", group.source, quota.username);
            evicted.push(group.source);
            records.extend(group.records);
        }
    }

    let breach = QuotaBreach {
        username: quota.username.clone(),
        port,
        max_devices: quota.max_devices,
        kept,
        evicted,
    };
    Some((breach, records))
}

/// Reconcile every quota against one snapshot
pub fn reconcile(snapshot: &Snapshot, quotas: &[UserQuota], fallback_port: u16) -> Reconciliation {
    let mut result = Reconciliation::default();

    for quota in quotas {
        if let Some((breach, records)) = reconcile_user(snapshot, quota, fallback_port) {
            result.evictions.extend(records);
            result.breaches.push(breach);
        }
    }

    result
}

/// Validate registry rows, logging and skipping the malformed ones
pub fn validate_quotas(rows: &[QuotaRow]) -> (Vec<UserQuota>, Vec<(String, QuotaError)>) {
    let mut quotas = Vec::with_capacity(rows.len());
    let mut skipped = Vec::new();

    for row in rows {
        match row.to_quota() {
            Ok(quota) => quotas.push(quota),
            Err(e) => {
                log::warn!("Skipping user {:?} this cycle: {}", row.username, e);
                skipped.push((row.username.clone(), e));
            }
        }
    }

    (quotas, skipped)
}
