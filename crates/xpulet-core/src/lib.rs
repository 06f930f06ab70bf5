//! xpulet-core: Core types for the xpulet scheduler
//!
//! This crate provides the fundamental types shared by the topology
//! allocator and the scheduling driver:
//! - Physical card state with virtual-instance bookkeeping
//! - Container and task resource requests
//! - Card families (GPU/NPU key sets)
//! - Annotation wire codecs and the node handshake
//! - Configuration and error handling

pub mod annotations;
pub mod config;
pub mod device;
pub mod error;
pub mod family;
pub mod request;

pub use annotations::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use family::*;
pub use request::*;

use uuid::Uuid;

/// Unique id of one task (pod) within a job.
pub type TaskId = Uuid;
/// Unique id of one job.
pub type JobId = Uuid;
