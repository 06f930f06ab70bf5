//! Container and task level XPU resource requests

use crate::device::CARD_TOTAL_CORES;

/// Requested cores must split on this granularity.
pub const CORE_STEP: u32 = 5;

/// One container's XPU request, already resolved to the three canonical
/// shapes:
///
/// - `num > 0, cores = 0, memory = 0` — whole card, exclusive: cores and
///   memory percentage both become 100;
/// - `num > 0, cores > 0, memory = 0` — fractional cores, full memory:
///   memory percentage becomes 100;
/// - `num > 0, cores > 0, memory > 0` — normal shared request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerRequest {
    /// Number of distinct cards
    pub num: usize,
    /// Core-units per card, in [0, 100]
    pub cores: u32,
    /// Memory per card in MiB; 0 means derive from `memory_pct`
    pub memory: u64,
    /// Memory percentage per card, applied against the card total when
    /// `memory` is 0
    pub memory_pct: u32,
    /// Restrict selection to cards of this type
    pub card_type: Option<String>,
}

impl ContainerRequest {
    /// Resolve raw limit values into the canonical request shape.
    /// `memory` is in MiB. Returns `None` when the container asks for no
    /// cards.
    pub fn resolve(num: usize, cores: u32, memory: u64, card_type: Option<String>) -> Option<Self> {
        if num == 0 {
            return None;
        }
        let (cores, memory, memory_pct) = if cores == 0 && memory == 0 {
            (CARD_TOTAL_CORES, 0, 100)
        } else if cores != 0 && memory == 0 {
            (cores, 0, 100)
        } else {
            (cores, memory, 0)
        };
        Some(Self {
            num,
            cores,
            memory,
            memory_pct,
            card_type,
        })
    }

    /// Memory to charge against a card with the given total, MiB.
    /// Percentage requests round down.
    pub fn memory_on(&self, total_memory: u64) -> u64 {
        if self.memory == 0 && self.memory_pct != 0 {
            total_memory * u64::from(self.memory_pct) / 100
        } else {
            self.memory
        }
    }
}

/// Aggregate of all container requests of one task's pod.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskResource {
    /// The family number key the pod requested under; empty when the pod
    /// asks for no XPU
    pub family_key: String,
    /// Total cards across containers
    pub num: usize,
    /// Σ cores × num over containers
    pub cores: u32,
    /// Σ memory × num over containers, MiB
    pub memory: u64,
    /// Σ memory_pct × num over containers
    pub memory_pct: u32,
    /// Type filter; all containers of a pod must agree
    pub card_type: Option<String>,
}

impl TaskResource {
    /// Fold one container request into the task aggregate.
    pub fn add(&mut self, req: &ContainerRequest) {
        let num = req.num as u32;
        self.num += req.num;
        self.cores += req.cores * num;
        self.memory += req.memory * req.num as u64;
        self.memory_pct += req.memory_pct * num;
        if self.card_type.is_none() {
            self.card_type = req.card_type.clone();
        }
    }

    /// A task is fractional (virtualized) unless every requested card is
    /// taken whole: all cores and all memory.
    pub fn is_fractional(&self) -> bool {
        let num = self.num as u32;
        self.cores != CARD_TOTAL_CORES * num || self.memory_pct != CARD_TOTAL_CORES * num
    }
}
