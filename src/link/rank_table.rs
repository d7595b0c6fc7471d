// Rank tables describe which devices participate in a communicator. Each
// side contributes a single-device table; the merge deduplicates servers,
// orders devices and assigns contiguous rank ids so both peers compute the
// same ranking independently.

use serde::{Deserialize, Serialize};

use crate::{Result, Status};

pub const RANK_TABLE_VERSION: &str = "1.2";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub super_device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_ip: String,
    #[serde(default = "default_rank_id")]
    pub rank_id: i32,
}

fn default_rank_id() -> i32 {
    -1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub device: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperPodInfo {
    pub super_pod_id: String,
    pub server_list: Vec<ServerIdInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdInfo {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankTableInfo {
    pub version: String,
    pub server_list: Vec<ServerInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub super_pod_list: Vec<SuperPodInfo>,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "completed".to_string()
}

impl RankTableInfo {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Status::ParamInvalid(format!("malformed rank table: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Status::Failed(format!("encode rank table: {e}")))
    }

    /// A one-server, one-device table for this process.
    pub fn local(server_id: &str, device_id: i32) -> Self {
        Self {
            version: RANK_TABLE_VERSION.to_string(),
            server_list: vec![ServerInfo {
                server_id: server_id.to_string(),
                device: vec![DeviceInfo {
                    device_id: device_id.to_string(),
                    super_device_id: String::new(),
                    device_ip: String::new(),
                    rank_id: -1,
                }],
            }],
            super_pod_list: Vec::new(),
            status: default_status(),
        }
    }

    /// Every device of the table in (server, device) order.
    fn devices(&self) -> impl Iterator<Item = (&str, &DeviceInfo)> {
        self.server_list
            .iter()
            .flat_map(|s| s.device.iter().map(move |d| (s.server_id.as_str(), d)))
    }
}

/// Outcome of a merge: the combined table plus the rank of each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRankTable {
    pub table: RankTableInfo,
    pub local_rank: u32,
    pub peer_rank: u32,
}

/// Merges the local and peer tables. Servers deduplicate by id, devices
/// sort within their server, and ranks are assigned contiguously across
/// the sorted server list. Each input must contribute exactly one device,
/// and the local device id must match the local logical device.
pub fn merge_rank_tables(
    local_device_id: i32,
    local: &RankTableInfo,
    peer: &RankTableInfo,
) -> Result<MergedRankTable> {
    let local_dev = single_device(local, "local")?;
    let peer_dev = single_device(peer, "peer")?;
    if local_dev.1.device_id != local_device_id.to_string() {
        return Err(Status::ParamInvalid(format!(
            "local rank table device {} does not match logical device {}",
            local_dev.1.device_id, local_device_id
        )));
    }

    use std::collections::BTreeMap;
    let mut servers: BTreeMap<String, Vec<DeviceInfo>> = BTreeMap::new();
    for (server_id, device) in local.devices().chain(peer.devices()) {
        let devices = servers.entry(server_id.to_string()).or_default();
        if !devices.iter().any(|d| {
            d.device_id == device.device_id
                && d.super_device_id == device.super_device_id
                && d.device_ip == device.device_ip
        }) {
            devices.push(device.clone());
        }
    }

    let mut table = RankTableInfo {
        version: RANK_TABLE_VERSION.to_string(),
        server_list: Vec::with_capacity(servers.len()),
        super_pod_list: merge_super_pods(local, peer),
        status: default_status(),
    };
    let mut next_rank = 0i32;
    let mut local_rank = None;
    let mut peer_rank = None;
    for (server_id, mut devices) in servers {
        devices.sort();
        for device in &mut devices {
            device.rank_id = next_rank;
            let is_local = server_id == local_dev.0 && device.device_id == local_dev.1.device_id;
            let is_peer = server_id == peer_dev.0 && device.device_id == peer_dev.1.device_id;
            if is_local {
                local_rank = Some(next_rank as u32);
            }
            // A self-link legitimately has both ends on one device.
            if is_peer && (!is_local || peer_dev == local_dev) {
                peer_rank = Some(next_rank as u32);
            }
            next_rank += 1;
        }
        table.server_list.push(ServerInfo {
            server_id,
            device: devices,
        });
    }

    match (local_rank, peer_rank) {
        (Some(local_rank), Some(peer_rank)) => Ok(MergedRankTable {
            table,
            local_rank,
            peer_rank,
        }),
        _ => Err(Status::LinkFailed("rank assignment lost a device".into())),
    }
}

fn single_device<'a>(
    table: &'a RankTableInfo,
    side: &str,
) -> Result<(&'a str, &'a DeviceInfo)> {
    let mut devices = table.devices();
    let first = devices
        .next()
        .ok_or_else(|| Status::ParamInvalid(format!("{side} rank table has no device")))?;
    if devices.next().is_some() {
        return Err(Status::ParamInvalid(format!(
            "{side} rank table must hold exactly one device"
        )));
    }
    Ok(first)
}

fn merge_super_pods(local: &RankTableInfo, peer: &RankTableInfo) -> Vec<SuperPodInfo> {
    let mut pods: Vec<SuperPodInfo> = Vec::new();
    for pod in local.super_pod_list.iter().chain(peer.super_pod_list.iter()) {
        match pods.iter_mut().find(|p| p.super_pod_id == pod.super_pod_id) {
            Some(existing) => {
                for server in &pod.server_list {
                    if !existing.server_list.iter().any(|s| s.server_id == server.server_id) {
                        existing.server_list.push(server.clone());
                    }
                }
            }
            None => pods.push(pod.clone()),
        }
    }
    pods
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_assigns_contiguous_ranks() {
        let local = RankTableInfo::local("server_a", 0);
        let peer = RankTableInfo::local("server_b", 1);
        let merged = merge_rank_tables(0, &local, &peer).unwrap();
        assert_eq!(merged.table.server_list.len(), 2);
        let ranks: Vec<i32> = merged
            .table
            .server_list
            .iter()
            .flat_map(|s| s.device.iter().map(|d| d.rank_id))
            .collect();
        assert_eq!(ranks, vec![0, 1]);
        assert_ne!(merged.local_rank, merged.peer_rank);
    }

    #[test]
    fn merge_deduplicates_same_server() {
        let local = RankTableInfo::local("server_a", 0);
        let mut peer = RankTableInfo::local("server_a", 1);
        peer.server_list[0].device[0].device_id = "1".to_string();
        let merged = merge_rank_tables(0, &local, &peer).unwrap();
        assert_eq!(merged.table.server_list.len(), 1);
        assert_eq!(merged.table.server_list[0].device.len(), 2);
    }

    #[test]
    fn both_sides_compute_the_same_ranking() {
        let a = RankTableInfo::local("server_a", 2);
        let b = RankTableInfo::local("server_b", 0);
        let from_a = merge_rank_tables(2, &a, &b).unwrap();
        let from_b = merge_rank_tables(0, &b, &a).unwrap();
        assert_eq!(from_a.table, from_b.table);
        assert_eq!(from_a.local_rank, from_b.peer_rank);
        assert_eq!(from_a.peer_rank, from_b.local_rank);
    }

    #[test]
    fn device_mismatch_is_rejected() {
        let local = RankTableInfo::local("server_a", 0);
        let peer = RankTableInfo::local("server_b", 1);
        assert!(matches!(
            merge_rank_tables(3, &local, &peer),
            Err(Status::ParamInvalid(_))
        ));
    }

    #[test]
    fn json_round_trips() {
        let table = RankTableInfo::local("server_a", 5);
        let json = table.to_json().unwrap();
        let parsed = RankTableInfo::parse(&json).unwrap();
        assert_eq!(parsed, table);
    }
}
