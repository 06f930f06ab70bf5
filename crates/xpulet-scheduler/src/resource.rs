//! Extraction of XPU requests from pod resource limits

use tracing::debug;

use xpulet_core::{
    CardFamily, ContainerRequest, SchedError, SchedResult, TaskResource, CORE_STEP,
    INTRA_BANDWIDTH_RESOURCE,
};

use crate::session::{ContainerSpec, PodInfo};

/// The card type filter of a container, from the family's
/// `...-type.<name>` resource key if one is present.
pub fn card_type_filter(container: &ContainerSpec, type_key_prefix: &str) -> Option<String> {
    container
        .limits
        .keys()
        .find_map(|key| key.strip_prefix(type_key_prefix))
        .map(str::to_string)
}

/// One container's request under `family`, `None` when the container asks
/// for no cards. Memory limits are declared in Gi and converted to MiB.
pub fn container_request(
    container: &ContainerSpec,
    family: &CardFamily,
) -> Option<ContainerRequest> {
    let num = container.limit(&family.number_key);
    if num <= 0 {
        debug!(container = %container.name, "container requests no xpu");
        return None;
    }
    let cores = container.limit(&family.cores_key).max(0) as u32;
    let memory = container.limit(&family.memory_key).max(0) as u64 * 1024;
    let card_type = card_type_filter(container, &family.type_key_prefix);
    ContainerRequest::resolve(num as usize, cores, memory, card_type)
}

/// All requesting containers of a pod, with the core granularity enforced.
pub fn pod_requests(pod: &PodInfo, family: &CardFamily) -> SchedResult<Vec<ContainerRequest>> {
    let mut requests = Vec::new();
    for container in &pod.containers {
        let Some(request) = container_request(container, family) else {
            continue;
        };
        if request.cores % CORE_STEP != 0 {
            return Err(SchedError::InvalidCoreRequest {
                container: container.name.clone(),
                cores: request.cores,
            });
        }
        requests.push(request);
    }
    Ok(requests)
}

/// The pod-level aggregate under `family`. `num == 0` means the pod asks
/// for nothing of this family.
pub fn task_resource(pod: &PodInfo, family: &CardFamily) -> TaskResource {
    let mut resource = TaskResource::default();
    for container in &pod.containers {
        if let Some(request) = container_request(container, family) {
            resource.family_key = family.number_key.clone();
            resource.add(&request);
        }
    }
    resource
}

/// The pod's intra-bandwidth floor: the first container that declares the
/// reserved bandwidth resource wins.
pub fn intra_bandwidth(pod: &PodInfo) -> i64 {
    pod.containers
        .iter()
        .find_map(|c| c.limits.get(INTRA_BANDWIDTH_RESOURCE))
        .copied()
        .unwrap_or(0)
}
