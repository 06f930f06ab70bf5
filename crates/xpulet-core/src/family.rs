//! Card families: the per-flavor resource keys and annotation names
//!
//! GPU and NPU scheduling share the algorithmic core and differ only in the
//! strings used on the orchestrator's resource and annotation surfaces. A
//! [`CardFamily`] bundles one flavor's key set; the driver keeps a registry
//! of families keyed by name.

/// Registered family name for GPU cards.
pub const GPU_FAMILY: &str = "gpu";
/// Registered family name for NPU cards.
pub const NPU_FAMILY: &str = "npu";

/// Resource-key and annotation-name configuration for one device flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardFamily {
    /// Registry name ("gpu" or "npu")
    pub name: String,
    /// Canonical device label written into device annotations
    pub device_label: String,
    /// Container resource key for the requested card count
    pub number_key: String,
    /// Container resource key for requested core-units per card
    pub cores_key: String,
    /// Container resource key for requested memory, denominated in Gi
    pub memory_key: String,
    /// Container resource key prefix for the card type filter; the suffix
    /// after the prefix names the type (e.g. `...-type.A910: 1`)
    pub type_key_prefix: String,
    /// Node annotation carrying the device registry
    pub node_register_anno: String,
    /// Node annotation carrying the interconnect matrix
    pub node_topology_anno: String,
    /// Node annotation carrying the freshness handshake
    pub node_handshake_anno: String,
    /// Pod annotation: devices the runtime agent still has to hand out
    pub to_allocate_anno: String,
    /// Pod annotation: devices bound to the pod, written by the scheduler
    pub to_pod_anno: String,
    /// Pod annotation: the node the pod was assigned to
    pub assigned_node_anno: String,
}

impl CardFamily {
    /// The GPU flavor key set.
    pub fn gpu() -> Self {
        Self {
            name: GPU_FAMILY.to_string(),
            device_label: "GPU".to_string(),
            number_key: "xpulet.io/vgpu-number".to_string(),
            cores_key: "xpulet.io/vgpu-cores".to_string(),
            memory_key: "xpulet.io/vgpu-memory.1Gi".to_string(),
            type_key_prefix: "xpulet.io/vgpu-type.".to_string(),
            node_register_anno: "xpulet.io/node-vgpu-register".to_string(),
            node_topology_anno: "xpulet.io/node-gpu-topology".to_string(),
            node_handshake_anno: "xpulet.io/node-vgpu-handshake".to_string(),
            to_allocate_anno: "xpulet.io/vgpu-devices-to-allocate".to_string(),
            to_pod_anno: "xpulet.io/vgpu-ids".to_string(),
            assigned_node_anno: "xpulet.io/vgpu-node".to_string(),
        }
    }

    /// The NPU flavor key set.
    pub fn npu() -> Self {
        Self {
            name: NPU_FAMILY.to_string(),
            device_label: "NPU".to_string(),
            number_key: "xpulet.io/vnpu-number".to_string(),
            cores_key: "xpulet.io/vnpu-cores".to_string(),
            memory_key: "xpulet.io/vnpu-memory.1Gi".to_string(),
            type_key_prefix: "xpulet.io/vnpu-type.".to_string(),
            node_register_anno: "xpulet.io/node-vnpu-register".to_string(),
            node_topology_anno: "xpulet.io/node-npu-topology".to_string(),
            node_handshake_anno: "xpulet.io/node-vnpu-handshake".to_string(),
            to_allocate_anno: "xpulet.io/vnpu-devices-to-allocate".to_string(),
            to_pod_anno: "xpulet.io/vnpu-ids".to_string(),
            assigned_node_anno: "xpulet.io/vnpu-node".to_string(),
        }
    }

    /// Canonicalize a raw device type for the wire: any type string
    /// containing the family label collapses to the label itself.
    pub fn canonical_type(&self, raw: &str) -> String {
        if raw.contains(&self.device_label) {
            self.device_label.clone()
        } else {
            raw.to_string()
        }
    }
}
