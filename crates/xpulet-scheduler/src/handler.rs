//! The job scheduling driver
//!
//! [`ScheduleHandler`] holds one cycle's state and answers the five
//! callbacks the hosting framework drives: job validation, per-(task,
//! node) predicates, batch node ordering, allocation events, and job
//! readiness. Predicate and order callbacks may arrive on parallel
//! workers; the device map sits behind one mutex and per-job state uses
//! its own interior locks.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use xpulet_core::{
    decode_node_devices, decode_pod_devices, encode_pod_devices, handshake_is_fresh, CardFamily,
    ContainerDeviceEntry, JobId, PluginArguments, PluginConfig, PodDevices, SchedError,
    SchedResult, XpuCard, ARG_TOPOLOGY_NODE_BANDWIDTH, ARG_TOPOLOGY_NODE_LIST, BIND_PHASE_ANNO,
    BIND_PHASE_ALLOCATING, BIND_TIME_ANNO, CARD_TOTAL_CORES,
};
use xpulet_topology::{
    allocate, decode_bandwidth_table, decode_topology, BandwidthTable, NodeResource,
    PodCardRequest,
};

use crate::fitter::fit_pod;
use crate::job::{SchedulerJob, TopologyPlan, TopologyScheduleResult, XpuTask};
use crate::session::{JobInfo, NodeInfo, Session, TaskInfo};

/// Score given to the node a topology plan pinned a task to.
pub const TOPOLOGY_PIN_SCORE: f64 = 10_000.0;

/// A failed job validation, surfaced to the framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateFailure {
    pub reason: String,
    pub message: String,
}

/// The outcome of a successful allocation event: the annotations the host
/// writes onto the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodBinding {
    pub node_name: String,
    pub annotations: HashMap<String, String>,
}

/// One cycle's scheduling driver.
pub struct ScheduleHandler {
    /// Registered card families, in detection order
    families: Vec<CardFamily>,
    config: PluginConfig,
    node_bandwidth: BandwidthTable,
    /// Per-node device maps, rebuilt from annotations during the cycle
    devices: Mutex<HashMap<String, HashMap<usize, XpuCard>>>,
    jobs: HashMap<JobId, SchedulerJob>,
    nodes: Vec<NodeInfo>,
    session_id: Uuid,
}

impl Default for ScheduleHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleHandler {
    /// A handler with the GPU and NPU families registered.
    pub fn new() -> Self {
        Self {
            families: vec![CardFamily::gpu(), CardFamily::npu()],
            config: PluginConfig::default(),
            node_bandwidth: BandwidthTable::new(),
            devices: Mutex::new(HashMap::new()),
            jobs: HashMap::new(),
            nodes: Vec::new(),
            session_id: Uuid::nil(),
        }
    }

    /// Register another family. A family already registered under the
    /// same name stays.
    pub fn register_family(&mut self, family: CardFamily) {
        if self.families.iter().any(|f| f.name == family.name) {
            return;
        }
        self.families.push(family);
    }

    /// Take over a new scheduling cycle: parse arguments, rebuild the job
    /// set, and drop the previous cycle's device state.
    pub fn open_session(&mut self, session: &Session) {
        self.session_id = session.id;
        self.config = session.arguments.plugin_config();
        self.node_bandwidth = node_bandwidth_from_args(&session.arguments);
        self.nodes = session.nodes.clone();
        self.jobs = session
            .jobs
            .iter()
            .filter_map(|job| SchedulerJob::build(job, &self.families))
            .map(|sjob| (sjob.id, sjob))
            .collect();
        if let Ok(mut devices) = self.devices.lock() {
            devices.clear();
        }
        debug!(
            session = %self.session_id,
            jobs = self.jobs.len(),
            nodes = self.nodes.len(),
            "session opened"
        );
    }

    /// The XPU job managed under `id`, if any.
    pub fn job(&self, id: JobId) -> Option<&SchedulerJob> {
        self.jobs.get(&id)
    }

    fn family(&self, name: &str) -> SchedResult<&CardFamily> {
        self.families
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| SchedError::InvalidArgument(format!("unknown card family {name}")))
    }

    /// Job validation callback: jobs not in their initial state are
    /// rejected before any placement work.
    pub fn job_valid(&self, job: &JobInfo) -> Option<ValidateFailure> {
        if job.valid_task_count() < job.min_available || job.terminating_task_count() > 0 {
            return Some(ValidateFailure {
                reason: "job is not in initial state".to_string(),
                message: format!("job {}/{} is not in initial state", job.namespace, job.name),
            });
        }
        None
    }

    /// Per-(task, node) predicate callback.
    ///
    /// Whole-card tasks under topology mode plan the whole job on the
    /// first call and then accept only their pinned node; fractional
    /// tasks run the fitter speculatively and record the node's score.
    pub fn node_predicate(&self, task: &TaskInfo, node: &NodeInfo) -> SchedResult<()> {
        let Some(job) = self.jobs.get(&task.job) else {
            return Ok(());
        };
        let Some(xpu_task) = job.task(task.uid) else {
            return Ok(());
        };
        if !xpu_task.requests_xpu() {
            return Ok(());
        }
        let result = self.predicate_inner(job, xpu_task, task, node);
        if let Err(err) = &result {
            job.record_pending(&err.to_string(), &node.name);
            debug!(task = %task.name, node = %node.name, error = %err, "predicate rejected");
        }
        result
    }

    fn predicate_inner(
        &self,
        job: &SchedulerJob,
        xpu_task: &XpuTask,
        task: &TaskInfo,
        node: &NodeInfo,
    ) -> SchedResult<()> {
        if !selector_matches(&job.selector, &node.labels) {
            return Err(SchedError::NoFitOnNode(
                "node labels do not meet the job selector".to_string(),
            ));
        }

        let unused = self.refresh_devices(job);

        if self.config.topology_enable && !xpu_task.is_fractional {
            let plan = job.plan_or_compute(|| self.plan_topology(job, &unused));
            return match plan.get(&task.uid) {
                Some(entry) if entry.node_name == node.name => Ok(()),
                Some(entry) => Err(SchedError::PlanMismatch {
                    planned: entry.node_name.clone(),
                    chosen: node.name.clone(),
                }),
                None => Err(SchedError::CannotAllocate),
            };
        }

        let family = self.family(&job.family)?;
        let devices = self.devices_of_node(&node.name);
        let mut score = 0.0;
        fit_pod(&devices, &task.pod, family, Some(&mut score))?;
        xpu_task.record_score(&node.name, score);
        debug!(task = %task.name, node = %node.name, score, "fractional fit");
        Ok(())
    }

    /// Node ordering callback: the scores recorded by predicate calls,
    /// with a topology-pinned node dominating everything else.
    pub fn batch_node_order(&self, task: &TaskInfo, nodes: &[NodeInfo]) -> HashMap<String, f64> {
        let mut scores: HashMap<String, f64> =
            nodes.iter().map(|n| (n.name.clone(), 0.0)).collect();
        let Some(job) = self.jobs.get(&task.job) else {
            return scores;
        };
        let Some(xpu_task) = job.task(task.uid) else {
            return HashMap::new();
        };
        if let Some(pinned) = job.plan().and_then(|plan| plan.get(&task.uid)) {
            scores.insert(pinned.node_name.clone(), TOPOLOGY_PIN_SCORE);
            return scores;
        }
        for (node_name, score) in xpu_task.scores() {
            scores.insert(node_name, score);
        }
        scores
    }

    /// Allocation callback for a task the framework bound to `node`.
    ///
    /// Returns the pod annotations to write, or `Ok(None)` when the task
    /// is not under XPU management.
    pub fn allocate_event(
        &self,
        task: &TaskInfo,
        node: &NodeInfo,
    ) -> SchedResult<Option<PodBinding>> {
        let Some(job) = self.jobs.get(&task.job) else {
            return Ok(None);
        };
        let Some(xpu_task) = job.task(task.uid) else {
            return Ok(None);
        };
        if !xpu_task.requests_xpu() {
            return Ok(None);
        }
        if !job.is_ready() {
            debug!(task = %task.name, "job not ready, allocation skipped");
            return Ok(None);
        }

        let family = self.family(&job.family)?;
        self.refresh_devices(job);
        let devices = self.devices_of_node(&node.name);

        let pod_devices = if self.config.topology_enable && !xpu_task.is_fractional {
            self.planned_pod_devices(job, task, node, &devices, family)?
        } else {
            fit_pod(&devices, &task.pod, family, None)?
        };

        Ok(Some(binding(family, &node.name, &pod_devices)))
    }

    /// Job readiness callback.
    pub fn job_ready(&self, job_id: JobId) -> bool {
        self.jobs.get(&job_id).map_or(true, SchedulerJob::is_ready)
    }

    /// Drain the cached topology plan for one pod, container by container
    /// in declaration order. Every granted card is whole: full memory,
    /// all cores.
    fn planned_pod_devices(
        &self,
        job: &SchedulerJob,
        task: &TaskInfo,
        node: &NodeInfo,
        devices: &HashMap<usize, XpuCard>,
        family: &CardFamily,
    ) -> SchedResult<PodDevices> {
        let plan = job
            .plan()
            .and_then(|plan| plan.get(&task.uid))
            .ok_or(SchedError::CannotAllocate)?;
        if plan.node_name != node.name {
            return Err(SchedError::PlanMismatch {
                planned: plan.node_name.clone(),
                chosen: node.name.clone(),
            });
        }

        let mut pod_devices = PodDevices::new();
        let mut start = 0;
        for container in &task.pod.containers {
            let num = container.limit(&family.number_key).max(0) as usize;
            if num == 0 {
                continue;
            }
            if start + num > plan.device_ids.len() {
                return Err(SchedError::NoFitOnNode(format!(
                    "plan reserves {} cards, containers want at least {}",
                    plan.device_ids.len(),
                    start + num
                )));
            }
            let mut entries = Vec::with_capacity(num);
            for id in &plan.device_ids[start..start + num] {
                let card = devices.get(id).ok_or_else(|| {
                    SchedError::NoFitOnNode(format!(
                        "planned card {id} does not exist on node {}",
                        node.name
                    ))
                })?;
                entries.push(ContainerDeviceEntry {
                    index: card.index,
                    uuid: card.uuid.clone(),
                    card_type: card.card_type.clone(),
                    used_memory: card.total_memory,
                    used_cores: CARD_TOTAL_CORES,
                    vid: 0,
                });
            }
            pod_devices.push(entries);
            start += num;
        }
        Ok(pod_devices)
    }

    /// Compute the job's topology plan. An empty result leaves every
    /// whole-card task of the job unschedulable for the cycle and clears
    /// the ready tag so no partial placement happens.
    fn plan_topology(
        &self,
        job: &SchedulerJob,
        unused: &HashMap<String, Vec<XpuCard>>,
    ) -> TopologyScheduleResult {
        let Ok(family) = self.family(&job.family) else {
            return TopologyScheduleResult::new();
        };

        let mut nodes = Vec::new();
        for node in &self.nodes {
            let Some(encoded) = node.annotations.get(&family.node_topology_anno) else {
                debug!(node = %node.name, "no topology annotation, node skipped");
                continue;
            };
            let topology = match decode_topology(encoded) {
                Ok(topology) => topology,
                Err(err) => {
                    debug!(node = %node.name, error = %err, "topology rejected, node skipped");
                    continue;
                }
            };
            let Some(free_cards) = unused.get(&node.name) else {
                continue;
            };
            nodes.push(NodeResource {
                node_name: node.name.clone(),
                topology,
                unused: free_cards.iter().map(|c| (c.index, c.clone())).collect(),
            });
        }
        if nodes.is_empty() {
            warn!(job = %job.name, "no node offers a topology, whole-card planning impossible");
            job.mark_unready();
            return TopologyScheduleResult::new();
        }

        let requests: Vec<PodCardRequest> = job
            .tasks
            .iter()
            .filter(|t| t.requests_xpu() && !t.is_fractional)
            .map(|t| PodCardRequest {
                task_id: t.uid,
                task_name: t.task_name.clone(),
                number_of_cards: t.resource.num,
                intra_bandwidth: t.intra_bandwidth,
                card_type: t.resource.card_type.clone(),
            })
            .collect();

        match allocate(
            &nodes,
            &requests,
            &job.inter_bandwidth,
            &self.node_bandwidth,
            self.config.numa_enable,
        ) {
            Ok(allocations) => {
                if allocations.len() != requests.len() {
                    warn!(job = %job.name, "plan does not cover every task");
                    job.mark_unready();
                    return TopologyScheduleResult::new();
                }
                allocations
                    .into_iter()
                    .map(|a| {
                        (
                            a.task_id,
                            TopologyPlan {
                                node_name: a.node_name,
                                device_ids: a.device_ids,
                            },
                        )
                    })
                    .collect()
            }
            Err(err) => {
                warn!(job = %job.name, error = %err, "topology allocation failed");
                job.mark_unready();
                TopologyScheduleResult::new()
            }
        }
    }

    /// Rebuild every node's device map from annotations, overlay this
    /// cycle's topology reservations, and return each node's unused cards
    /// ordered by index.
    fn refresh_devices(&self, job: &SchedulerJob) -> HashMap<String, Vec<XpuCard>> {
        let Ok(family) = self.family(&job.family) else {
            return HashMap::new();
        };
        let reserved = self.topology_reservations();

        let mut unused_of_nodes = HashMap::new();
        for node in &self.nodes {
            let mut cards = self.devices_from_node(family, node).unwrap_or_default();
            if let Some(ids) = reserved.get(&node.name) {
                for id in ids {
                    if let Some(card) = cards.get_mut(id) {
                        card.mark_reserved();
                    }
                }
            }
            let mut free: Vec<XpuCard> = cards
                .values()
                .filter(|c| c.health && !c.in_use)
                .cloned()
                .collect();
            free.sort_by_key(|c| c.index);
            unused_of_nodes.insert(node.name.clone(), free);
            if let Ok(mut devices) = self.devices.lock() {
                devices.insert(node.name.clone(), cards);
            }
        }
        unused_of_nodes
    }

    /// Cards already promised to tasks by any job's topology plan.
    fn topology_reservations(&self) -> HashMap<String, HashSet<usize>> {
        let mut reserved: HashMap<String, HashSet<usize>> = HashMap::new();
        for job in self.jobs.values() {
            let Some(plan) = job.plan() else { continue };
            for entry in plan.values() {
                reserved
                    .entry(entry.node_name.clone())
                    .or_default()
                    .extend(entry.device_ids.iter().copied());
            }
        }
        reserved
    }

    /// One node's card registry with resident allocations replayed.
    /// `None` excludes the node from the cycle: no registry annotation, a
    /// stale handshake, or an undecodable registry.
    fn devices_from_node(
        &self,
        family: &CardFamily,
        node: &NodeInfo,
    ) -> Option<HashMap<usize, XpuCard>> {
        let Some(registry) = node.annotations.get(&family.node_register_anno) else {
            warn!(node = %node.name, anno = %family.node_register_anno, "register annotation missing");
            return None;
        };
        if !self.config.test_enable {
            let fresh = node
                .annotations
                .get(&family.node_handshake_anno)
                .map(|value| handshake_is_fresh(value, Utc::now()))
                .unwrap_or(false);
            if !fresh {
                warn!(node = %node.name, "handshake missing or stale, node excluded");
                return None;
            }
        }
        let mut cards = match decode_node_devices(registry, &node.name) {
            Ok(cards) => cards,
            Err(err) => {
                warn!(node = %node.name, error = %err, "register annotation rejected");
                return None;
            }
        };

        for pod in &node.pods {
            let Some(encoded) = pod.annotations.get(&family.to_pod_anno) else {
                continue;
            };
            let pod_devices = match decode_pod_devices(encoded) {
                Ok(devices) => devices,
                Err(err) => {
                    warn!(pod = %pod.name, error = %err, "pod device annotation rejected");
                    continue;
                }
            };
            for entry in pod_devices.iter().flatten() {
                if let Some(card) = cards.values_mut().find(|c| c.uuid == entry.uuid) {
                    card.used_memory += entry.used_memory;
                    card.used_cores += entry.used_cores;
                    card.occupy_vid(entry.vid);
                    card.in_use = true;
                }
            }
        }
        Some(cards)
    }

    /// This cycle's device view of one node, empty when the node was
    /// excluded.
    fn devices_of_node(&self, node_name: &str) -> HashMap<usize, XpuCard> {
        self.devices
            .lock()
            .ok()
            .and_then(|devices| devices.get(node_name).cloned())
            .unwrap_or_default()
    }
}

/// Every job selector key must be present on the node, and the node's
/// value must match one of the job's `|`-joined alternatives.
fn selector_matches(
    selector: &HashMap<String, String>,
    labels: &HashMap<String, String>,
) -> bool {
    selector.iter().all(|(key, wanted)| {
        labels
            .get(key)
            .map(|have| wanted.split('|').any(|alt| alt.eq_ignore_ascii_case(have)))
            .unwrap_or(false)
    })
}

fn node_bandwidth_from_args(args: &PluginArguments) -> BandwidthTable {
    let Some(list) = args.get(ARG_TOPOLOGY_NODE_LIST) else {
        return BandwidthTable::new();
    };
    let Some(matrix) = args.get(ARG_TOPOLOGY_NODE_BANDWIDTH) else {
        warn!("node list given without a bandwidth matrix");
        return BandwidthTable::new();
    };
    match decode_bandwidth_table(list, matrix) {
        Ok(table) => table,
        Err(err) => {
            warn!(error = %err, "node bandwidth rejected, all pairs treated as unknown");
            BandwidthTable::new()
        }
    }
}

/// The annotation set recording one pod's device assignment.
fn binding(family: &CardFamily, node_name: &str, pod_devices: &PodDevices) -> PodBinding {
    let canonical: PodDevices = pod_devices
        .iter()
        .map(|container| {
            container
                .iter()
                .map(|entry| ContainerDeviceEntry {
                    card_type: family.canonical_type(&entry.card_type),
                    ..entry.clone()
                })
                .collect()
        })
        .collect();
    let encoded = encode_pod_devices(&canonical);

    let mut annotations = HashMap::new();
    annotations.insert(family.to_allocate_anno.clone(), encoded.clone());
    annotations.insert(family.to_pod_anno.clone(), encoded);
    annotations.insert(family.assigned_node_anno.clone(), node_name.to_string());
    annotations.insert(
        BIND_TIME_ANNO.to_string(),
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string(),
    );
    annotations.insert(
        BIND_PHASE_ANNO.to_string(),
        BIND_PHASE_ALLOCATING.to_string(),
    );
    PodBinding {
        node_name: node_name.to_string(),
        annotations,
    }
}
