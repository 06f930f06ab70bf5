//! Per-job scheduling state
//!
//! A [`SchedulerJob`] is built once per cycle from the framework's job
//! snapshot: per-task resource aggregates, the fractional/whole-card
//! classification, the inter-task bandwidth requirements, and the
//! run-once topology plan cache shared by all of the job's predicate
//! calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::warn;

use xpulet_core::{
    CardFamily, JobId, TaskId, TaskResource, INTER_BANDWIDTH_ANNO, TASK_SPEC_ANNO,
    TOPOLOGY_TASK_LIST_ANNO,
};
use xpulet_topology::{decode_bandwidth_table, BandwidthTable};

use crate::resource::{intra_bandwidth, task_resource};
use crate::session::{JobInfo, TaskInfo};

/// Cards reserved for one task by the job's topology plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub node_name: String,
    pub device_ids: Vec<usize>,
}

/// The per-cycle plan cache: task id to its pinned node and cards. An
/// empty map records a planning attempt that failed; every task of the
/// job then stays unschedulable for the cycle.
pub type TopologyScheduleResult = HashMap<TaskId, TopologyPlan>;

/// One task of an XPU job.
#[derive(Debug)]
pub struct XpuTask {
    pub uid: TaskId,
    pub name: String,
    /// Grouping key for inter-pod bandwidth, from the task-spec annotation
    pub task_name: String,
    pub resource: TaskResource,
    /// Virtualized (fractional) rather than whole-card
    pub is_fractional: bool,
    /// Minimum pairwise bandwidth among this task's cards
    pub intra_bandwidth: i64,
    /// Node the task is already bound to, if any
    pub node_name: Option<String>,
    /// Per-node fit scores recorded by predicate calls
    score_map: Mutex<HashMap<String, f64>>,
}

impl XpuTask {
    /// Whether this task requests any cards at all.
    pub fn requests_xpu(&self) -> bool {
        self.resource.num > 0
    }

    pub fn record_score(&self, node_name: &str, score: f64) {
        if let Ok(mut scores) = self.score_map.lock() {
            scores.insert(node_name.to_string(), score);
        }
    }

    pub fn scores(&self) -> HashMap<String, f64> {
        self.score_map
            .lock()
            .map(|scores| scores.clone())
            .unwrap_or_default()
    }
}

/// A job under XPU management for the current cycle.
#[derive(Debug)]
pub struct SchedulerJob {
    pub id: JobId,
    pub name: String,
    pub namespace: String,
    /// Registry name of the card family every task requested under
    pub family: String,
    /// Pod-group annotations
    pub annotations: HashMap<String, String>,
    /// Node selectors accumulated over the job's tasks
    pub selector: HashMap<String, String>,
    /// Total cards requested across tasks
    pub total_cards: usize,
    /// Tasks in snapshot order; the allocator sees them in this order
    pub tasks: Vec<XpuTask>,
    /// Per-task-pair bandwidth floors from the pod-group annotations
    pub inter_bandwidth: BandwidthTable,
    ready: AtomicBool,
    pending: Mutex<HashMap<String, String>>,
    plan: OnceLock<TopologyScheduleResult>,
}

impl SchedulerJob {
    /// Build the XPU view of a job. Returns `None` when the job requests
    /// no XPU, or when its tasks disagree on the family resource name.
    pub fn build(job: &JobInfo, families: &[CardFamily]) -> Option<Self> {
        if job.tasks.is_empty() {
            return None;
        }

        let mut family_name: Option<&CardFamily> = None;
        let mut total_cards = 0;
        let mut tasks = Vec::with_capacity(job.tasks.len());

        for task in &job.tasks {
            let (resource, detected) = detect_resource(task, families);
            if let Some(detected) = detected {
                match family_name {
                    None => family_name = Some(detected),
                    Some(existing) if existing.name != detected.name => {
                        warn!(
                            job = %job.name,
                            first = %existing.name,
                            second = %detected.name,
                            "job mixes card families, not managed"
                        );
                        return None;
                    }
                    _ => {}
                }
            }
            total_cards += resource.num;
            let num = resource.num as u32;
            tasks.push(XpuTask {
                uid: task.uid,
                name: task.name.clone(),
                task_name: task
                    .pod
                    .annotations
                    .get(TASK_SPEC_ANNO)
                    .cloned()
                    .unwrap_or_default(),
                is_fractional: resource.is_fractional() && num > 0,
                intra_bandwidth: intra_bandwidth(&task.pod),
                node_name: task.node_name.clone(),
                resource,
                score_map: Mutex::new(HashMap::new()),
            });
        }

        let family = family_name?;
        Some(Self {
            id: job.uid,
            name: job.name.clone(),
            namespace: job.namespace.clone(),
            family: family.name.clone(),
            annotations: job.annotations.clone(),
            selector: merge_selectors(job),
            total_cards,
            tasks,
            inter_bandwidth: decode_inter_bandwidth(&job.annotations, &job.name),
            ready: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            plan: OnceLock::new(),
        })
    }

    pub fn task(&self, uid: TaskId) -> Option<&XpuTask> {
        self.tasks.iter().find(|t| t.uid == uid)
    }

    /// The topology plan, computing it on the first call. Later calls get
    /// the cached result regardless of what they would have computed.
    pub fn plan_or_compute<F>(&self, compute: F) -> &TopologyScheduleResult
    where
        F: FnOnce() -> TopologyScheduleResult,
    {
        self.plan.get_or_init(compute)
    }

    /// The topology plan if one was computed this cycle.
    pub fn plan(&self) -> Option<&TopologyScheduleResult> {
        self.plan.get()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_unready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Record a predicate failure reason against a node.
    pub fn record_pending(&self, reason: &str, node_name: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            let nodes = pending.entry(reason.to_string()).or_default();
            nodes.push_str(node_name);
            nodes.push(' ');
        }
    }

    /// Reason to node-name list, for the job's pending message.
    pub fn pending_reasons(&self) -> HashMap<String, String> {
        self.pending
            .lock()
            .map(|pending| pending.clone())
            .unwrap_or_default()
    }
}

/// Try each registered family in order; the first one the pod requests
/// under wins.
fn detect_resource<'a>(
    task: &TaskInfo,
    families: &'a [CardFamily],
) -> (TaskResource, Option<&'a CardFamily>) {
    for family in families {
        let resource = task_resource(&task.pod, family);
        if resource.num > 0 {
            return (resource, Some(family));
        }
    }
    (TaskResource::default(), None)
}

/// Accumulate the node selectors of all tasks. Differing values for one
/// key are joined with `|`; a node matching any alternative satisfies it.
fn merge_selectors(job: &JobInfo) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = HashMap::new();
    for task in &job.tasks {
        for (key, value) in &task.pod.node_selector {
            match merged.get_mut(key) {
                None => {
                    merged.insert(key.clone(), value.clone());
                }
                Some(existing) => {
                    let already = existing
                        .split('|')
                        .any(|alt| alt.eq_ignore_ascii_case(value));
                    if !already {
                        existing.push('|');
                        existing.push_str(value);
                    }
                }
            }
        }
    }
    merged
}

/// Decode the per-job inter-task bandwidth table from the pod-group
/// annotations. Absent annotations or a list/matrix mismatch mean no
/// requirements.
fn decode_inter_bandwidth(
    annotations: &HashMap<String, String>,
    job_name: &str,
) -> BandwidthTable {
    let Some(task_list) = annotations.get(TOPOLOGY_TASK_LIST_ANNO) else {
        return BandwidthTable::new();
    };
    let Some(matrix) = annotations.get(INTER_BANDWIDTH_ANNO) else {
        return BandwidthTable::new();
    };
    match decode_bandwidth_table(task_list, matrix) {
        Ok(table) => table,
        Err(err) => {
            warn!(job = %job_name, error = %err, "inter-bandwidth annotation rejected");
            BandwidthTable::new()
        }
    }
}
