//! Topology-aware whole-card allocator
//!
//! Joint assignment of pods to nodes and cards to pods under intra-pod and
//! inter-pod bandwidth floors, with an optional single-NUMA preference.
//! Pure over its input snapshot: the search enumerates pod-to-node
//! distributions, prunes on capacity and inter-node bandwidth, then
//! enumerates distinct card pickings per node. The first candidate with no
//! NUMA violations wins; otherwise the candidate with the fewest wins.
//! Iteration order is the input order throughout, so equal inputs produce
//! equal plans.

use std::collections::HashMap;

use tracing::debug;
use xpulet_core::{SchedError, SchedResult, TaskId, XpuCard};

use crate::bandwidth::{bandwidth_between, BandwidthTable};

/// One node's view offered to the allocator: the interconnect matrix and
/// the cards still free this cycle, keyed by card index.
#[derive(Debug, Clone)]
pub struct NodeResource {
    pub node_name: String,
    pub topology: Vec<Vec<i64>>,
    pub unused: HashMap<usize, XpuCard>,
}

/// One pod's whole-card request.
#[derive(Debug, Clone)]
pub struct PodCardRequest {
    pub task_id: TaskId,
    /// Grouping key for inter-pod bandwidth lookups
    pub task_name: String,
    pub number_of_cards: usize,
    /// Minimum pairwise bandwidth among this pod's cards
    pub intra_bandwidth: i64,
    /// Restrict the picking to cards of this type
    pub card_type: Option<String>,
}

/// A placed pod: the node and the exact card indices it received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAllocation {
    pub task_id: TaskId,
    pub node_name: String,
    pub device_ids: Vec<usize>,
}

struct NodeGroup<'a> {
    node: &'a NodeResource,
    requests: Vec<&'a PodCardRequest>,
}

/// Place every pod of `pod_requests` onto `nodes`, or fail with
/// [`SchedError::CannotAllocate`].
///
/// `inter_bandwidth` carries the per-task-pair floors; `node_bandwidth`
/// the measured node-to-node bandwidth (missing pairs read as 0 and fail
/// any positive floor). With `numa` set, pickings whose pods each stay on
/// one NUMA node are preferred; the plan with the fewest NUMA-violating
/// pods is returned, first discovered winning ties.
pub fn allocate(
    nodes: &[NodeResource],
    pod_requests: &[PodCardRequest],
    inter_bandwidth: &BandwidthTable,
    node_bandwidth: &BandwidthTable,
    numa: bool,
) -> SchedResult<Vec<PodAllocation>> {
    let mut best: Option<Vec<PodAllocation>> = None;
    let mut min_invalid = pod_requests.len() + 1;

    for distribution in all_distributions(nodes.len(), pod_requests.len()) {
        let Some(groups) = node_groups(&distribution, nodes, pod_requests) else {
            continue;
        };
        if !inter_bandwidth.is_empty() && !inter_gate(&groups, inter_bandwidth, node_bandwidth) {
            continue;
        }
        let Some((allocations, invalid)) = allocate_groups(&groups, numa) else {
            continue;
        };
        if invalid == 0 {
            return Ok(allocations);
        }
        if invalid < min_invalid {
            min_invalid = invalid;
            best = Some(allocations);
        }
    }

    best.ok_or_else(|| {
        debug!(
            pods = pod_requests.len(),
            nodes = nodes.len(),
            "topology search exhausted"
        );
        SchedError::CannotAllocate
    })
}

/// Every function from pod index to node index, as per-node pod lists.
fn all_distributions(node_count: usize, pod_count: usize) -> Vec<Vec<Vec<usize>>> {
    let mut result = Vec::new();
    let mut current = vec![Vec::new(); node_count];
    distribute(node_count, pod_count, 0, &mut current, &mut result);
    result
}

fn distribute(
    node_count: usize,
    pod_count: usize,
    pod: usize,
    current: &mut Vec<Vec<usize>>,
    result: &mut Vec<Vec<Vec<usize>>>,
) {
    if pod == pod_count {
        result.push(current.clone());
        return;
    }
    for node in 0..node_count {
        current[node].push(pod);
        distribute(node_count, pod_count, pod + 1, current, result);
        current[node].pop();
    }
}

/// Bind a distribution to concrete nodes, rejecting it when any node lacks
/// the free cards for its pods.
fn node_groups<'a>(
    distribution: &[Vec<usize>],
    nodes: &'a [NodeResource],
    pod_requests: &'a [PodCardRequest],
) -> Option<Vec<NodeGroup<'a>>> {
    let mut groups = Vec::new();
    for (node_idx, pod_indexes) in distribution.iter().enumerate() {
        if pod_indexes.is_empty() {
            continue;
        }
        let node = &nodes[node_idx];
        let requests: Vec<&PodCardRequest> =
            pod_indexes.iter().map(|&i| &pod_requests[i]).collect();
        let cards_wanted: usize = requests.iter().map(|r| r.number_of_cards).sum();
        if cards_wanted > node.unused.len() {
            return None;
        }
        groups.push(NodeGroup { node, requests });
    }
    Some(groups)
}

/// Every cross-node pod pair must see at least its required bandwidth.
fn inter_gate(
    groups: &[NodeGroup<'_>],
    inter_bandwidth: &BandwidthTable,
    node_bandwidth: &BandwidthTable,
) -> bool {
    for i in 0..groups.len() {
        for j in i + 1..groups.len() {
            let available = bandwidth_between(
                node_bandwidth,
                &groups[i].node.node_name,
                &groups[j].node.node_name,
            );
            for p in &groups[i].requests {
                for q in &groups[j].requests {
                    if required_bandwidth(inter_bandwidth, &p.task_name, &q.task_name) > available
                    {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// The floor between two tasks, checked in both directions so an
/// asymmetric input matrix still gates conservatively.
fn required_bandwidth(inter_bandwidth: &BandwidthTable, a: &str, b: &str) -> i64 {
    bandwidth_between(inter_bandwidth, a, b).max(bandwidth_between(inter_bandwidth, b, a))
}

/// Pick cards on every node of the distribution; fails the whole
/// distribution when any node has no legal picking.
fn allocate_groups(groups: &[NodeGroup<'_>], numa: bool) -> Option<(Vec<PodAllocation>, usize)> {
    let mut result = Vec::new();
    let mut invalid_total = 0;
    for group in groups {
        let (allocations, invalid) = pick_on_node(group.node, &group.requests, numa)?;
        invalid_total += invalid;
        result.extend(allocations);
    }
    Some((result, invalid_total))
}

/// Search the distinct assignments of this node's card slots to its pods.
fn pick_on_node(
    node: &NodeResource,
    requests: &[&PodCardRequest],
    numa: bool,
) -> Option<(Vec<PodAllocation>, usize)> {
    let slots = node.topology.len();
    let cards_wanted: usize = requests.iter().map(|r| r.number_of_cards).sum();
    if cards_wanted > slots {
        return None;
    }

    let mask = initial_mask(slots, requests);
    let mut best: Option<Vec<PodAllocation>> = None;
    let mut min_invalid = requests.len() + 1;

    for_each_unique_permutation(&mask, &mut |perm| {
        let device_ids = group_by_pod(perm, requests.len());
        let Some(allocations) = legal_allocation(&device_ids, node, requests) else {
            return false;
        };
        if !numa {
            best = Some(allocations);
            min_invalid = 0;
            return true;
        }
        let invalid = numa_invalid_count(node, &allocations);
        if invalid == 0 {
            best = Some(allocations);
            min_invalid = 0;
            return true;
        }
        if invalid < min_invalid {
            min_invalid = invalid;
            best = Some(allocations);
        }
        false
    });

    best.map(|allocations| (allocations, min_invalid))
}

/// Slot-assignment mask: pod index `i` appears `number_of_cards(i)` times,
/// the sentinel `requests.len()` fills the rest. Nondecreasing by
/// construction, which the duplicate-skip rule below relies on.
fn initial_mask(slots: usize, requests: &[&PodCardRequest]) -> Vec<usize> {
    let sentinel = requests.len();
    let mut mask = vec![sentinel; slots];
    let mut next = 0;
    for (pod, request) in requests.iter().enumerate() {
        for _ in 0..request.number_of_cards {
            mask[next] = pod;
            next += 1;
        }
    }
    mask
}

/// Visit every distinct permutation of `mask` in stable order. The visitor
/// returns true to stop the enumeration.
fn for_each_unique_permutation<F>(mask: &[usize], visit: &mut F)
where
    F: FnMut(&[usize]) -> bool,
{
    let mut visited = vec![false; mask.len()];
    let mut current = Vec::with_capacity(mask.len());
    permute(mask, &mut visited, &mut current, visit);
}

fn permute<F>(nums: &[usize], visited: &mut [bool], current: &mut Vec<usize>, visit: &mut F) -> bool
where
    F: FnMut(&[usize]) -> bool,
{
    if current.len() == nums.len() {
        return visit(current);
    }
    for i in 0..nums.len() {
        if visited[i] {
            continue;
        }
        // skip duplicates: an equal element to the left must be placed first
        if i > 0 && nums[i] == nums[i - 1] && !visited[i - 1] {
            continue;
        }
        visited[i] = true;
        current.push(nums[i]);
        let stop = permute(nums, visited, current, visit);
        current.pop();
        visited[i] = false;
        if stop {
            return true;
        }
    }
    false
}

/// Invert a permuted mask into per-pod card-index lists. The position in
/// the mask is the card index; the value is the pod index.
fn group_by_pod(mask: &[usize], pod_count: usize) -> Vec<Vec<usize>> {
    let mut device_ids = vec![Vec::new(); pod_count];
    for (card, &pod) in mask.iter().enumerate() {
        if pod < pod_count {
            device_ids[pod].push(card);
        }
    }
    device_ids
}

/// Check one picking: every card unused and type-matching, every card pair
/// of a pod at or above the pod's intra-bandwidth floor.
fn legal_allocation(
    device_ids: &[Vec<usize>],
    node: &NodeResource,
    requests: &[&PodCardRequest],
) -> Option<Vec<PodAllocation>> {
    let mut allocations = Vec::with_capacity(requests.len());
    for (pod, ids) in device_ids.iter().enumerate() {
        let request = requests[pod];
        if !meets_intra_bandwidth(&node.topology, ids, request.intra_bandwidth) {
            return None;
        }
        for id in ids {
            let card = node.unused.get(id)?;
            if let Some(wanted) = &request.card_type {
                if &card.card_type != wanted {
                    return None;
                }
            }
        }
        allocations.push(PodAllocation {
            task_id: request.task_id,
            node_name: node.node_name.clone(),
            device_ids: ids.clone(),
        });
    }
    Some(allocations)
}

fn meets_intra_bandwidth(topology: &[Vec<i64>], ids: &[usize], floor: i64) -> bool {
    for i in 0..ids.len() {
        for j in i + 1..ids.len() {
            let (row, col) = (ids[i], ids[j]);
            if row >= topology.len() || col >= topology[row].len() {
                return false;
            }
            if topology[row][col] < floor {
                return false;
            }
        }
    }
    true
}

/// Count pods whose cards span more than one NUMA node.
fn numa_invalid_count(node: &NodeResource, allocations: &[PodAllocation]) -> usize {
    let mut invalid = 0;
    for allocation in allocations {
        let mut seen: Option<i32> = None;
        for id in &allocation.device_ids {
            let Some(card) = node.unused.get(id) else {
                continue;
            };
            match seen {
                Some(numa) if card.numa != numa => {
                    invalid += 1;
                    break;
                }
                _ => seen = Some(card.numa),
            }
        }
    }
    invalid
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn card(index: usize, numa: i32) -> XpuCard {
        XpuCard {
            index,
            uuid: format!("XPU-{index}"),
            node_name: String::new(),
            card_type: "A910".to_string(),
            health: true,
            total_memory: 32768,
            slot_count: 8,
            used_cores: 0,
            used_memory: 0,
            used_vids: 0,
            in_use: false,
            numa,
        }
    }

    fn node(name: &str, topology: Vec<Vec<i64>>, numas: &[i32]) -> NodeResource {
        let unused = numas
            .iter()
            .enumerate()
            .map(|(i, &numa)| (i, card(i, numa)))
            .collect();
        NodeResource {
            node_name: name.to_string(),
            topology,
            unused,
        }
    }

    fn request(name: &str, cards: usize, intra: i64) -> PodCardRequest {
        PodCardRequest {
            task_id: Uuid::new_v4(),
            task_name: name.to_string(),
            number_of_cards: cards,
            intra_bandwidth: intra,
            card_type: None,
        }
    }

    fn uniform(side: usize, bandwidth: i64) -> Vec<Vec<i64>> {
        vec![vec![bandwidth; side]; side]
    }

    #[test]
    fn test_zero_pods_is_empty_success() {
        let nodes = vec![node("node-a", uniform(2, 100), &[0, 0])];
        let result =
            allocate(&nodes, &[], &BandwidthTable::new(), &BandwidthTable::new(), false).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_zero_nodes_cannot_allocate() {
        let pods = vec![request("t1", 1, 0)];
        let err = allocate(&[], &pods, &BandwidthTable::new(), &BandwidthTable::new(), false);
        assert!(matches!(err, Err(SchedError::CannotAllocate)));
    }

    #[test]
    fn test_oversize_request_cannot_allocate() {
        let nodes = vec![node("node-a", uniform(2, 100), &[0, 0])];
        let pods = vec![request("t1", 3, 0)];
        let err = allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false);
        assert!(matches!(err, Err(SchedError::CannotAllocate)));
    }

    #[test]
    fn test_single_pod_single_node() {
        let nodes = vec![node("node-a", uniform(2, 100), &[0, 0])];
        let pods = vec![request("t1", 2, 50)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false)
                .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].node_name, "node-a");
        assert_eq!(result[0].device_ids, vec![0, 1]);
        assert_eq!(result[0].task_id, pods[0].task_id);
    }

    // Two fast pairs {0,1} and {2,3}; every cross pair is below the floor.
    fn paired_topology() -> Vec<Vec<i64>> {
        vec![
            vec![0, 50, 10, 10],
            vec![50, 0, 10, 10],
            vec![10, 10, 0, 50],
            vec![10, 10, 50, 0],
        ]
    }

    #[test]
    fn test_intra_bandwidth_floor_selects_fast_pair() {
        let nodes = vec![node("node-a", paired_topology(), &[0, 0, 0, 0])];
        let pods = vec![request("t1", 2, 40)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false)
                .unwrap();
        let ids = &result[0].device_ids;
        assert!(
            *ids == vec![0, 1] || *ids == vec![2, 3],
            "picked a cross pair: {ids:?}"
        );
    }

    #[test]
    fn test_intra_bandwidth_floor_unsatisfiable() {
        let nodes = vec![node("node-a", paired_topology(), &[0, 0, 0, 0])];
        let pods = vec![request("t1", 3, 40)];
        let err = allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false);
        assert!(matches!(err, Err(SchedError::CannotAllocate)));
    }

    #[test]
    fn test_inter_bandwidth_forces_colocation() {
        let nodes = vec![
            node("node-a", uniform(2, 100), &[0, 0]),
            node("node-b", uniform(2, 100), &[0, 0]),
        ];
        let pods = vec![request("t1", 1, 0), request("t2", 1, 0)];
        let inter = crate::bandwidth::decode_bandwidth_table("t1,t2", "0,50;50,0").unwrap();
        let node_bw =
            crate::bandwidth::decode_bandwidth_table("node-a,node-b", "0,30;30,0").unwrap();

        let result = allocate(&nodes, &pods, &inter, &node_bw, false).unwrap();
        assert_eq!(result[0].node_name, result[1].node_name);
    }

    #[test]
    fn test_inter_bandwidth_satisfied_allows_spread() {
        let nodes = vec![
            node("node-a", uniform(1, 100), &[0]),
            node("node-b", uniform(1, 100), &[0]),
        ];
        // one card per node: colocation is impossible, the link must carry it
        let pods = vec![request("t1", 1, 0), request("t2", 1, 0)];
        let inter = crate::bandwidth::decode_bandwidth_table("t1,t2", "0,50;50,0").unwrap();

        let node_bw =
            crate::bandwidth::decode_bandwidth_table("node-a,node-b", "0,60;60,0").unwrap();
        let result = allocate(&nodes, &pods, &inter, &node_bw, false).unwrap();
        assert_ne!(result[0].node_name, result[1].node_name);

        // unknown node bandwidth reads as zero and fails the positive floor
        let err = allocate(&nodes, &pods, &inter, &BandwidthTable::new(), false);
        assert!(matches!(err, Err(SchedError::CannotAllocate)));
    }

    #[test]
    fn test_numa_off_takes_first_permutation() {
        let nodes = vec![node("node-a", uniform(4, 100), &[0, 0, 1, 1])];
        let pods = vec![request("t1", 2, 0)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false)
                .unwrap();
        assert_eq!(result[0].device_ids, vec![0, 1]);
    }

    #[test]
    fn test_numa_on_never_splits_when_avoidable() {
        let nodes = vec![node("node-a", uniform(4, 100), &[0, 0, 1, 1])];
        let pods = vec![request("t1", 2, 0)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), true)
                .unwrap();
        let ids = &result[0].device_ids;
        assert!(
            *ids == vec![0, 1] || *ids == vec![2, 3],
            "split across NUMA nodes: {ids:?}"
        );
    }

    #[test]
    fn test_numa_on_minimizes_violations_when_unavoidable() {
        // three cards across two NUMA nodes; a 3-card pod must span them,
        // but the plan is still returned with exactly one violation
        let nodes = vec![node("node-a", uniform(4, 100), &[0, 0, 1, 1])];
        let pods = vec![request("t1", 3, 0)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), true)
                .unwrap();
        assert_eq!(result[0].device_ids.len(), 3);
    }

    #[test]
    fn test_numa_prefers_zero_invalid_across_pods() {
        // pod wanting 2 + pod wanting 2 over NUMA layout [0,0,1,1]: the
        // only zero-invalid plans give each pod one full NUMA node
        let nodes = vec![node("node-a", uniform(4, 100), &[0, 0, 1, 1])];
        let pods = vec![request("t1", 2, 0), request("t2", 2, 0)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), true)
                .unwrap();
        for allocation in &result {
            let numas: Vec<i32> = allocation
                .device_ids
                .iter()
                .map(|id| nodes[0].unused[id].numa)
                .collect();
            assert!(numas.windows(2).all(|w| w[0] == w[1]), "pod spans NUMA: {numas:?}");
        }
    }

    #[test]
    fn test_type_filter_restricts_picking() {
        let mut n = node("node-a", uniform(2, 100), &[0, 0]);
        n.unused.get_mut(&0).unwrap().card_type = "L20".to_string();
        let nodes = vec![n];

        let mut pod = request("t1", 1, 0);
        pod.card_type = Some("A910".to_string());
        let result =
            allocate(&nodes, &[pod], &BandwidthTable::new(), &BandwidthTable::new(), false)
                .unwrap();
        assert_eq!(result[0].device_ids, vec![1]);
    }

    #[test]
    fn test_used_card_slots_are_skipped() {
        // topology side 4 but only cards 2 and 3 are still unused
        let mut n = node("node-a", uniform(4, 100), &[0, 0, 0, 0]);
        n.unused.remove(&0);
        n.unused.remove(&1);
        let nodes = vec![n];

        let pods = vec![request("t1", 2, 0)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false)
                .unwrap();
        assert_eq!(result[0].device_ids, vec![2, 3]);
    }

    #[test]
    fn test_all_pods_placed_or_none() {
        let nodes = vec![node("node-a", uniform(2, 100), &[0, 0])];
        // second pod cannot fit after the first takes both cards
        let pods = vec![request("t1", 2, 0), request("t2", 1, 0)];
        let err = allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false);
        assert!(matches!(err, Err(SchedError::CannotAllocate)));
    }

    #[test]
    fn test_feasibility_invariants() {
        let nodes = vec![
            node("node-a", uniform(3, 100), &[0, 0, 1]),
            node("node-b", uniform(2, 100), &[0, 0]),
        ];
        let pods = vec![request("t1", 2, 50), request("t2", 2, 50)];
        let result =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), false)
                .unwrap();
        assert_eq!(result.len(), 2);
        for (allocation, pod) in result.iter().zip(&pods) {
            assert_eq!(allocation.device_ids.len(), pod.number_of_cards);
            let mut ids = allocation.device_ids.clone();
            ids.dedup();
            assert_eq!(ids.len(), pod.number_of_cards, "duplicate card indices");
        }
    }

    #[test]
    fn test_determinism() {
        let nodes = vec![
            node("node-a", uniform(4, 100), &[0, 0, 1, 1]),
            node("node-b", uniform(4, 100), &[0, 0, 1, 1]),
        ];
        let pods = vec![request("t1", 2, 0), request("t2", 1, 0)];
        let first =
            allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), true)
                .unwrap();
        for _ in 0..5 {
            let again =
                allocate(&nodes, &pods, &BandwidthTable::new(), &BandwidthTable::new(), true)
                    .unwrap();
            assert_eq!(again, first);
        }
    }
}
