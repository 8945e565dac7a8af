//! DNS records of a cluster

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::{OrchestratorError, Result};
use crate::filesys::file::File;
use crate::models::cluster::ProvisionedNode;

const KV_PORT: u16 = 11210;
const KV_TLS_PORT: u16 = 11207;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    A,
    Aaaa,
    Srv,
}

/// One record set, keyed by its fully qualified name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub kind: RecordKind,
    pub values: Vec<String>,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Zone every cluster name lives under
    fn hostname(&self) -> &str;

    /// Upsert record sets by name and kind
    async fn update_records(
        &self,
        records: &[DnsRecord],
        no_wait: bool,
        no_wait_for_propagation: bool,
    ) -> Result<()>;

    /// Remove every record set of the given names; absent names are ignored
    async fn remove_records(
        &self,
        names: &[String],
        no_wait: bool,
        no_wait_for_propagation: bool,
    ) -> Result<()>;
}

pub fn cluster_name(cluster_id: &str, zone: &str) -> String {
    format!("{}.{}", cluster_id, zone)
}

pub fn node_name(node_id: &str, cluster_id: &str, zone: &str) -> String {
    format!("{}.{}", node_id, cluster_name(cluster_id, zone))
}

fn srv_names(cluster: &str) -> [String; 2] {
    [
        format!("_couchbase._tcp.{}", cluster),
        format!("_couchbases._tcp.{}", cluster),
    ]
}

fn address_kind(ip: &str) -> RecordKind {
    if ip.contains(':') {
        RecordKind::Aaaa
    } else {
        RecordKind::A
    }
}

/// Every record the cluster should have, computed from its live members
pub fn cluster_records(cluster_id: &str, zone: &str, members: &[&ProvisionedNode]) -> Vec<DnsRecord> {
    let cluster = cluster_name(cluster_id, zone);
    let mut records = Vec::new();
    let mut cluster_ips: BTreeMap<RecordKind, Vec<String>> = BTreeMap::new();
    let mut targets = Vec::new();

    for member in members.iter().filter(|m| !m.ip_address.is_empty()) {
        let name = member
            .dns_name
            .clone()
            .unwrap_or_else(|| node_name(&member.node_id, cluster_id, zone));
        let kind = address_kind(&member.ip_address);
        records.push(DnsRecord {
            name: name.clone(),
            kind,
            values: vec![member.ip_address.clone()],
        });
        cluster_ips.entry(kind).or_default().push(member.ip_address.clone());
        targets.push(name);
    }

    for (kind, values) in cluster_ips {
        records.push(DnsRecord {
            name: cluster.clone(),
            kind,
            values,
        });
    }

    if !targets.is_empty() {
        let [plain, secure] = srv_names(&cluster);
        for (name, port) in [(plain, KV_PORT), (secure, KV_TLS_PORT)] {
            records.push(DnsRecord {
                name,
                kind: RecordKind::Srv,
                values: targets
                    .iter()
                    .map(|t| format!("0 0 {} {}", port, t))
                    .collect(),
            });
        }
    }

    records
}

/// Every name the cluster may own, including those of departed nodes
pub fn cluster_record_names(cluster_id: &str, zone: &str, nodes: &[&ProvisionedNode]) -> Vec<String> {
    let cluster = cluster_name(cluster_id, zone);
    let mut names: Vec<String> = nodes
        .iter()
        .map(|n| {
            n.dns_name
                .clone()
                .unwrap_or_else(|| node_name(&n.node_id, cluster_id, zone))
        })
        .collect();
    names.push(cluster.clone());
    names.extend(srv_names(&cluster));
    names
}

/// Whether `name` is `zone` itself or a name below it
fn in_zone(name: &str, zone: &str) -> bool {
    name == zone
        || name
            .strip_suffix(zone)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

type ZoneRecords = BTreeMap<(String, RecordKind), DnsRecord>;

/// Keeps records in a local JSON zone file, for resolvers that serve from it.
/// One record set exists per name and kind.
pub struct ZoneFileDnsProvider {
    zone: String,
    file: File,
    lock: Mutex<()>,
}

impl ZoneFileDnsProvider {
    pub fn new(zone: impl Into<String>, file: File) -> Self {
        Self {
            zone: zone.into(),
            file,
            lock: Mutex::new(()),
        }
    }

    /// Every record set in the zone, ordered by name then kind
    pub async fn records(&self) -> Result<Vec<DnsRecord>> {
        Ok(self.load().await?.into_values().collect())
    }

    async fn load(&self) -> Result<ZoneRecords> {
        let records: Vec<DnsRecord> = self.file.read_json_or_default().await?;
        Ok(records
            .into_iter()
            .map(|r| ((r.name.clone(), r.kind), r))
            .collect())
    }

    async fn store(&self, zone: ZoneRecords) -> Result<()> {
        let records: Vec<DnsRecord> = zone.into_values().collect();
        self.file.write_json(&records).await
    }
}

#[async_trait]
impl DnsProvider for ZoneFileDnsProvider {
    fn hostname(&self) -> &str {
        &self.zone
    }

    async fn update_records(
        &self,
        records: &[DnsRecord],
        _no_wait: bool,
        _no_wait_for_propagation: bool,
    ) -> Result<()> {
        if let Some(outside) = records.iter().find(|r| !in_zone(&r.name, &self.zone)) {
            return Err(OrchestratorError::DnsError(format!(
                "{} is outside zone {}",
                outside.name, self.zone
            )));
        }

        let _guard = self.lock.lock().await;
        let mut zone = self.load().await?;
        for record in records {
            debug!("Upserting {:?} {} -> {:?}", record.kind, record.name, record.values);
            zone.insert((record.name.clone(), record.kind), record.clone());
        }
        self.store(zone).await?;
        info!("Updated {} DNS record sets", records.len());
        Ok(())
    }

    async fn remove_records(
        &self,
        names: &[String],
        _no_wait: bool,
        _no_wait_for_propagation: bool,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut zone = self.load().await?;
        let before = zone.len();
        zone.retain(|(name, _), _| !names.contains(name));
        let removed = before - zone.len();
        self.store(zone).await?;
        info!("Removed {} DNS record sets", removed);
        Ok(())
    }
}
