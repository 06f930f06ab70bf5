//! Wire codecs for the annotation formats shared with the node agent
//!
//! Node device registries, container/pod device assignments, and the node
//! handshake all travel as plain strings in orchestrator annotations.
//! Records are `:`-separated with `,`-separated fields; pods separate
//! containers with `;`. Encode and decode are exact inverses on valid input.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use std::collections::HashMap;
use tracing::warn;

use crate::device::{ContainerDeviceEntry, ContainerDevices, PodDevices, XpuCard};
use crate::error::{SchedError, SchedResult};

/// Pod annotation: bind timestamp, decimal nanoseconds since epoch.
pub const BIND_TIME_ANNO: &str = "xpulet.io/bind-time";
/// Pod annotation: device bind phase.
pub const BIND_PHASE_ANNO: &str = "xpulet.io/bind-phase";
/// Bind phase while the runtime agent is still handing devices out.
pub const BIND_PHASE_ALLOCATING: &str = "allocating";
/// Bind phase after the runtime agent finished.
pub const BIND_PHASE_SUCCESS: &str = "success";
/// Bind phase when device hand-out failed.
pub const BIND_PHASE_FAILED: &str = "failed";

/// Container resource key: minimum pairwise bandwidth among the pod's cards.
pub const INTRA_BANDWIDTH_RESOURCE: &str = "xpulet.io/intra-bandwidth";
/// Pod-group annotation: ordered task list for the inter-bandwidth matrix.
pub const TOPOLOGY_TASK_LIST_ANNO: &str = "xpulet.io/topology-task-list";
/// Pod-group annotation: inter-task bandwidth requirement matrix.
pub const INTER_BANDWIDTH_ANNO: &str = "xpulet.io/inter-bandwidth";
/// Pod annotation: the task name used as the inter-bandwidth grouping key.
pub const TASK_SPEC_ANNO: &str = "xpulet.io/task-spec";

/// A handshake older than this is stale and the node sits the cycle out.
pub const HANDSHAKE_TOLERATE_SECS: i64 = 60;

const NODE_DEVICE_FIELDS: usize = 7;
const CONTAINER_DEVICE_FIELDS: usize = 6;
const HANDSHAKE_PREFIX: &str = "Reported_";
const HANDSHAKE_TIME_FORMAT: &str = "%Y.%m.%d %H:%M:%S";
/// Node agents report handshake timestamps in UTC+8 local time.
const HANDSHAKE_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Encode a node's card inventory for the register annotation.
///
/// One record per card: `index,uuid,count,memory,type,health,numa`,
/// records joined and terminated by `:`.
pub fn encode_node_devices(cards: &[XpuCard]) -> String {
    let mut out = String::new();
    for card in cards {
        out.push_str(&format!(
            "{},{},{},{},{},{},{}:",
            card.index,
            card.uuid,
            card.slot_count,
            card.total_memory,
            card.card_type,
            card.health,
            card.numa
        ));
    }
    out
}

/// Decode the register annotation into fresh card state keyed by index.
///
/// A trailing `:` is tolerated; any malformed record rejects the whole
/// annotation.
pub fn decode_node_devices(s: &str, node_name: &str) -> SchedResult<HashMap<usize, XpuCard>> {
    if !s.contains(':') {
        return Err(SchedError::BadDeviceAnnotation(format!(
            "node register has no record separator: {s}"
        )));
    }
    let mut cards = HashMap::new();
    for record in s.split(':') {
        if !record.contains(',') {
            continue;
        }
        let fields: Vec<&str> = record.split(',').collect();
        if fields.len() != NODE_DEVICE_FIELDS {
            return Err(SchedError::BadDeviceAnnotation(format!(
                "node register record has {} fields, want {}: {record}",
                fields.len(),
                NODE_DEVICE_FIELDS
            )));
        }
        let bad = |what: &str| {
            SchedError::BadDeviceAnnotation(format!("node register {what} unparsable: {record}"))
        };
        let index: usize = fields[0].parse().map_err(|_| bad("index"))?;
        let slot_count: u32 = fields[2].parse().map_err(|_| bad("count"))?;
        let total_memory: u64 = fields[3].parse().map_err(|_| bad("memory"))?;
        let health: bool = fields[5].parse().map_err(|_| bad("health"))?;
        let numa: i32 = fields[6].parse().map_err(|_| bad("numa"))?;
        cards.insert(
            index,
            XpuCard {
                index,
                uuid: fields[1].to_string(),
                node_name: node_name.to_string(),
                card_type: fields[4].to_string(),
                health,
                total_memory,
                slot_count,
                used_cores: 0,
                used_memory: 0,
                used_vids: 0,
                in_use: false,
                numa,
            },
        );
    }
    Ok(cards)
}

/// Encode one container's device list:
/// `index,uuid,type,used_memory,used_cores,vid` records, `:`-terminated.
pub fn encode_container_devices(devices: &ContainerDevices) -> String {
    let mut out = String::new();
    for dev in devices {
        out.push_str(&format!(
            "{},{},{},{},{},{}:",
            dev.index, dev.uuid, dev.card_type, dev.used_memory, dev.used_cores, dev.vid
        ));
    }
    out
}

/// Encode a pod's device lists, one container encoding per requesting
/// container, joined with `;`.
pub fn encode_pod_devices(devices: &PodDevices) -> String {
    devices
        .iter()
        .map(encode_container_devices)
        .collect::<Vec<_>>()
        .join(";")
}

/// Decode one container's device list.
pub fn decode_container_devices(s: &str) -> SchedResult<ContainerDevices> {
    let mut devices = ContainerDevices::new();
    if s.is_empty() {
        return Ok(devices);
    }
    for record in s.split(':') {
        if !record.contains(',') {
            continue;
        }
        let fields: Vec<&str> = record.split(',').collect();
        if fields.len() != CONTAINER_DEVICE_FIELDS {
            return Err(SchedError::BadDeviceAnnotation(format!(
                "container device record has {} fields, want {}: {record}",
                fields.len(),
                CONTAINER_DEVICE_FIELDS
            )));
        }
        let bad = |what: &str| {
            SchedError::BadDeviceAnnotation(format!("container device {what} unparsable: {record}"))
        };
        devices.push(ContainerDeviceEntry {
            index: fields[0].parse().map_err(|_| bad("index"))?,
            uuid: fields[1].to_string(),
            card_type: fields[2].to_string(),
            used_memory: fields[3].parse().map_err(|_| bad("memory"))?,
            used_cores: fields[4].parse().map_err(|_| bad("cores"))?,
            vid: fields[5].parse().map_err(|_| bad("vid"))?,
        });
    }
    Ok(devices)
}

/// Decode a pod's device annotation.
pub fn decode_pod_devices(s: &str) -> SchedResult<PodDevices> {
    if s.is_empty() {
        return Ok(PodDevices::new());
    }
    s.split(';').map(decode_container_devices).collect()
}

/// Whether a node handshake annotation is fresh at `now`.
///
/// The value looks like `Reported_2025.11.30 18:04:12`, stamped in UTC+8.
/// Anything missing the prefix, unparsable, or older than
/// [`HANDSHAKE_TOLERATE_SECS`] counts as stale.
pub fn handshake_is_fresh(value: &str, now: DateTime<Utc>) -> bool {
    let Some(stamp) = value.strip_prefix(HANDSHAKE_PREFIX) else {
        warn!(handshake = value, "handshake missing Reported prefix");
        return false;
    };
    let Ok(naive) = NaiveDateTime::parse_from_str(stamp, HANDSHAKE_TIME_FORMAT) else {
        warn!(handshake = value, "handshake timestamp unparsable");
        return false;
    };
    let offset = match FixedOffset::east_opt(HANDSHAKE_UTC_OFFSET_SECS) {
        Some(offset) => offset,
        None => return false,
    };
    let Some(reported) = naive.and_local_timezone(offset).single() else {
        return false;
    };
    now.signed_duration_since(reported.with_timezone(&Utc)).num_seconds()
        <= HANDSHAKE_TOLERATE_SECS
}
