//! Fractional device fitter
//!
//! Given one node's cards and a pod's container requests, pick concrete
//! cards and deduct cores, memory, and a virtual-instance slot per grant.
//! Cards are scanned from the highest index down and the first admissible
//! ones win. The fitter mutates the card list it is given; callers run it
//! on a copy when the evaluation is speculative.

use std::collections::HashMap;

use tracing::debug;

use xpulet_core::{
    CardFamily, ContainerDeviceEntry, ContainerDevices, ContainerRequest, PodDevices, SchedError,
    SchedResult, XpuCard, CARD_TOTAL_CORES,
};

use crate::resource::pod_requests;
use crate::session::PodInfo;

/// Weight of one card's memory saturation in the node score.
pub const SCORE_MULTIPLIER: f64 = 100.0;

/// Whether `card` can take one grant of `request`.
fn admissible(card: &XpuCard, request: &ContainerRequest) -> bool {
    if !card.has_free_slot() {
        debug!(card = %card.uuid, vids = card.used_vids, "no free vid slot");
        return false;
    }
    let memory = request.memory_on(card.total_memory);
    if card.free_memory() < memory {
        debug!(card = %card.uuid, want = memory, free = card.free_memory(), "memory short");
        return false;
    }
    if card.free_cores() < request.cores {
        debug!(card = %card.uuid, want = request.cores, free = card.free_cores(), "cores short");
        return false;
    }
    // an exclusive request never lands on a card that is already shared
    if request.cores == CARD_TOTAL_CORES && card.used_vids != 0 {
        debug!(card = %card.uuid, "exclusive request against shared card");
        return false;
    }
    // a zero-core request never lands on an already-full card, so that
    // sharing is never implicit
    if request.cores == 0 && card.used_cores == CARD_TOTAL_CORES {
        debug!(card = %card.uuid, "zero-core request against full card");
        return false;
    }
    if let Some(wanted) = &request.card_type {
        if &card.card_type != wanted {
            debug!(card = %card.uuid, want = %wanted, have = %card.card_type, "type mismatch");
            return false;
        }
    }
    true
}

/// Grant one container's request out of `cards`, highest index first.
/// Returns `None` when fewer than `request.num` cards are admissible;
/// partial deductions are left on `cards` and the caller discards them
/// with the copy.
fn fit_container(
    cards: &mut [XpuCard],
    request: &ContainerRequest,
    score: &mut Option<&mut f64>,
) -> Option<ContainerDevices> {
    let mut remaining = request.num;
    let mut devices = ContainerDevices::new();
    for i in (0..cards.len()).rev() {
        if remaining == 0 {
            break;
        }
        if !admissible(&cards[i], request) {
            continue;
        }
        let card = &mut cards[i];
        let memory = request.memory_on(card.total_memory);
        let vid = card.alloc_vid();
        card.used_memory += memory;
        card.used_cores += request.cores;
        devices.push(ContainerDeviceEntry {
            index: card.index,
            uuid: card.uuid.clone(),
            card_type: card.card_type.clone(),
            used_memory: memory,
            used_cores: request.cores,
            vid,
        });
        if let Some(score) = score {
            **score += SCORE_MULTIPLIER * (card.used_memory as f64 / card.total_memory as f64);
        }
        remaining -= 1;
    }
    (remaining == 0).then_some(devices)
}

/// Fit every container request of a pod onto `cards`, in declaration
/// order. Containers see each other's deductions. Whole-pod semantics:
/// any unfillable container fails the pod.
pub fn fit_pod_requests(
    cards: &mut [XpuCard],
    requests: &[ContainerRequest],
    mut score: Option<&mut f64>,
) -> SchedResult<PodDevices> {
    let mut pod_devices = PodDevices::new();
    for request in requests {
        if request.num > cards.len() {
            return Err(SchedError::NoFitOnNode(format!(
                "request wants {} cards, node has {}",
                request.num,
                cards.len()
            )));
        }
        match fit_container(cards, request, &mut score) {
            Some(devices) => pod_devices.push(devices),
            None => {
                return Err(SchedError::NoFitOnNode(
                    "not enough cards satisfy the request".to_string(),
                ))
            }
        }
    }
    Ok(pod_devices)
}

/// Order a node's card map by index, requiring a dense 0..N layout so
/// indices stay valid as matrix coordinates.
pub fn ordered_cards(devices: &HashMap<usize, XpuCard>) -> SchedResult<Vec<XpuCard>> {
    let mut cards: Vec<XpuCard> = devices.values().cloned().collect();
    cards.sort_by_key(|c| c.index);
    for (position, card) in cards.iter().enumerate() {
        if card.index != position {
            return Err(SchedError::InvalidDeviceIndex(card.node_name.clone()));
        }
    }
    Ok(cards)
}

/// Fit a pod onto a node's device snapshot. The snapshot itself is not
/// touched; deductions happen on an ordered copy. With `score` given, the
/// node's rank accumulates per granted card.
pub fn fit_pod(
    devices: &HashMap<usize, XpuCard>,
    pod: &PodInfo,
    family: &CardFamily,
    score: Option<&mut f64>,
) -> SchedResult<PodDevices> {
    let mut cards = ordered_cards(devices)?;
    let requests = pod_requests(pod, family)?;
    fit_pod_requests(&mut cards, &requests, score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(index: usize, total_memory: u64) -> XpuCard {
        XpuCard {
            index,
            uuid: format!("XPU-{index}"),
            node_name: "node-a".to_string(),
            card_type: "A910".to_string(),
            health: true,
            total_memory,
            slot_count: 8,
            used_cores: 0,
            used_memory: 0,
            used_vids: 0,
            in_use: false,
            numa: 0,
        }
    }

    fn shared(num: usize, cores: u32, memory: u64) -> ContainerRequest {
        ContainerRequest {
            num,
            cores,
            memory,
            memory_pct: 0,
            card_type: None,
        }
    }

    #[test]
    fn test_single_fractional_fit() {
        // one 16 Gi card, a 30-core 4 Gi request
        let mut cards = vec![card(0, 16 * 1024)];
        let devices =
            fit_pod_requests(&mut cards, &[shared(1, 30, 4 * 1024)], None).unwrap();

        assert_eq!(devices.len(), 1);
        let entry = &devices[0][0];
        assert_eq!(entry.index, 0);
        assert_eq!(entry.used_cores, 30);
        assert_eq!(entry.used_memory, 4 * 1024);
        assert_eq!(entry.vid, 0);

        assert_eq!(cards[0].used_cores, 30);
        assert_eq!(cards[0].used_memory, 4 * 1024);
        assert_eq!(cards[0].used_vids, 0b1);
    }

    #[test]
    fn test_exclusive_request_rejects_shared_card() {
        let mut c = card(0, 16 * 1024);
        c.used_vids = 0b01;
        let mut cards = vec![c];
        let err = fit_pod_requests(&mut cards, &[shared(1, 100, 0)], None);
        assert!(matches!(err, Err(SchedError::NoFitOnNode(_))));
    }

    #[test]
    fn test_no_new_container_on_full_card() {
        let mut c = card(0, 16 * 1024);
        c.used_cores = 100;
        c.used_vids = 0b1;
        let mut cards = vec![c];
        let err = fit_pod_requests(&mut cards, &[shared(1, 10, 1024)], None);
        assert!(matches!(err, Err(SchedError::NoFitOnNode(_))));
    }

    #[test]
    fn test_zero_core_request_rejects_full_card() {
        let mut full = card(0, 16 * 1024);
        full.used_cores = 100;
        let mut cards = vec![full];
        let err = fit_pod_requests(&mut cards, &[shared(1, 0, 1024)], None);
        assert!(matches!(err, Err(SchedError::NoFitOnNode(_))));
    }

    #[test]
    fn test_highest_index_first() {
        let mut cards = vec![card(0, 16 * 1024), card(1, 16 * 1024), card(2, 16 * 1024)];
        let devices = fit_pod_requests(&mut cards, &[shared(2, 30, 1024)], None).unwrap();
        let picked: Vec<usize> = devices[0].iter().map(|d| d.index).collect();
        assert_eq!(picked, vec![2, 1]);
    }

    #[test]
    fn test_memory_percentage_resolves_per_card() {
        let request = ContainerRequest {
            num: 1,
            cores: 30,
            memory: 0,
            memory_pct: 50,
            card_type: None,
        };
        let mut cards = vec![card(0, 10_000)];
        let devices = fit_pod_requests(&mut cards, &[request], None).unwrap();
        assert_eq!(devices[0][0].used_memory, 5_000);
        assert_eq!(cards[0].used_memory, 5_000);
    }

    #[test]
    fn test_vid_slots_exhausted() {
        let mut c = card(0, 16 * 1024);
        c.slot_count = 1;
        c.used_vids = 0b1;
        c.used_cores = 10;
        c.used_memory = 1024;
        let mut cards = vec![c];
        let err = fit_pod_requests(&mut cards, &[shared(1, 10, 1024)], None);
        assert!(matches!(err, Err(SchedError::NoFitOnNode(_))));
    }

    #[test]
    fn test_request_larger_than_node() {
        let mut cards = vec![card(0, 16 * 1024)];
        let err = fit_pod_requests(&mut cards, &[shared(2, 10, 1024)], None);
        assert!(matches!(err, Err(SchedError::NoFitOnNode(_))));
    }

    #[test]
    fn test_type_filter() {
        let mut l20 = card(1, 16 * 1024);
        l20.card_type = "L20".to_string();
        let mut cards = vec![card(0, 16 * 1024), l20];

        let request = ContainerRequest {
            card_type: Some("A910".to_string()),
            ..shared(1, 30, 1024)
        };
        let devices = fit_pod_requests(&mut cards, &[request], None).unwrap();
        assert_eq!(devices[0][0].index, 0);
    }

    #[test]
    fn test_containers_see_prior_deductions() {
        // two containers of one pod, 60 cores each: they cannot share the
        // single card and the second lands on the lower-index one
        let mut cards = vec![card(0, 16 * 1024), card(1, 16 * 1024)];
        let requests = vec![shared(1, 60, 1024), shared(1, 60, 1024)];
        let devices = fit_pod_requests(&mut cards, &requests, None).unwrap();
        assert_eq!(devices[0][0].index, 1);
        assert_eq!(devices[1][0].index, 0);
    }

    #[test]
    fn test_card_state_conservation() {
        let mut cards = vec![card(0, 16 * 1024), card(1, 16 * 1024)];
        let before: Vec<_> = cards.iter().map(|c| (c.used_cores, c.used_memory)).collect();
        let requests = vec![shared(2, 20, 1024), shared(1, 10, 512)];
        fit_pod_requests(&mut cards, &requests, None).unwrap();

        let delta_cores: u32 = cards
            .iter()
            .zip(&before)
            .map(|(c, b)| c.used_cores - b.0)
            .sum();
        let delta_memory: u64 = cards
            .iter()
            .zip(&before)
            .map(|(c, b)| c.used_memory - b.1)
            .sum();
        let vids: u32 = cards.iter().map(|c| c.vid_count()).sum();
        assert_eq!(delta_cores, 20 * 2 + 10);
        assert_eq!(delta_memory, 1024 * 2 + 512);
        assert_eq!(vids, 3);
    }

    #[test]
    fn test_score_accumulates_memory_saturation() {
        let mut cards = vec![card(0, 1024)];
        let mut score = 0.0;
        fit_pod_requests(&mut cards, &[shared(1, 30, 512)], Some(&mut score)).unwrap();
        assert!((score - 50.0).abs() < f64::EPSILON, "score was {score}");
    }

    #[test]
    fn test_ordered_cards_requires_dense_indices() {
        let mut devices = HashMap::new();
        devices.insert(0, card(0, 1024));
        devices.insert(2, card(2, 1024));
        assert!(matches!(
            ordered_cards(&devices),
            Err(SchedError::InvalidDeviceIndex(_))
        ));
    }
}
