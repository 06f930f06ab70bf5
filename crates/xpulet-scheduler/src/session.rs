//! Scheduling-cycle snapshot handed over by the hosting orchestrator
//!
//! The framework owns pod and job lifecycle; at the start of a cycle it
//! hands the driver a plain-data snapshot of jobs, tasks, and nodes. All
//! device state is reconstructed from the annotation strings carried here.

use std::collections::HashMap;
use uuid::Uuid;

use xpulet_core::{JobId, PluginArguments, TaskId};

/// One container of a pod: its name and integer resource limits.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    /// Resource key to integer quantity, as declared in the pod spec
    pub limits: HashMap<String, i64>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: HashMap::new(),
        }
    }

    /// The limit under `key`, 0 when absent.
    pub fn limit(&self, key: &str) -> i64 {
        self.limits.get(key).copied().unwrap_or(0)
    }

    pub fn with_limit(mut self, key: impl Into<String>, value: i64) -> Self {
        self.limits.insert(key.into(), value);
        self
    }
}

/// A pod as seen by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub annotations: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub node_selector: HashMap<String, String>,
    pub containers: Vec<ContainerSpec>,
}

/// One task of a job: a pod plus its scheduling identity.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub uid: TaskId,
    pub job: JobId,
    pub name: String,
    /// Node the task is already bound to, if any
    pub node_name: Option<String>,
    /// The pod is being deleted
    pub terminating: bool,
    pub pod: PodInfo,
}

impl TaskInfo {
    pub fn new(job: JobId, name: impl Into<String>, pod: PodInfo) -> Self {
        Self {
            uid: Uuid::new_v4(),
            job,
            name: name.into(),
            node_name: None,
            terminating: false,
            pod,
        }
    }
}

/// A job: the unit of atomic placement.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub uid: JobId,
    pub name: String,
    pub namespace: String,
    /// Tasks that must be schedulable for the job to proceed
    pub min_available: usize,
    /// Pod-group annotations (inter-bandwidth inputs live here)
    pub annotations: HashMap<String, String>,
    pub tasks: Vec<TaskInfo>,
}

impl JobInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            name: name.into(),
            namespace: "default".to_string(),
            min_available: 0,
            annotations: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Tasks not currently being torn down.
    pub fn valid_task_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.terminating).count()
    }

    pub fn terminating_task_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.terminating).count()
    }
}

/// A node as seen by the scheduler: annotations carry the device registry,
/// topology, and handshake; resident pods carry replayed allocations.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub name: String,
    pub annotations: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Pods already running on the node
    pub pods: Vec<PodInfo>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// One scheduling cycle's input.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: Uuid,
    pub jobs: Vec<JobInfo>,
    pub nodes: Vec<NodeInfo>,
    pub arguments: PluginArguments,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_limit_lookup() {
        let c = ContainerSpec::new("main").with_limit("xpulet.io/vgpu-number", 2);
        assert_eq!(c.limit("xpulet.io/vgpu-number"), 2);
        assert_eq!(c.limit("xpulet.io/vgpu-cores"), 0);
    }

    #[test]
    fn test_job_task_counts() {
        let mut job = JobInfo::new("train");
        job.tasks.push(TaskInfo::new(job.uid, "worker-0", PodInfo::default()));
        let mut dying = TaskInfo::new(job.uid, "worker-1", PodInfo::default());
        dying.terminating = true;
        job.tasks.push(dying);

        assert_eq!(job.valid_task_count(), 1);
        assert_eq!(job.terminating_task_count(), 1);
    }
}
