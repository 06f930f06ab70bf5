//! xpulet-scheduler: fractional fitting and the job scheduling driver
//!
//! This crate turns one cycle's orchestrator snapshot into placement
//! decisions:
//! - The fractional device fitter for virtualized sharing
//! - Per-job state with the run-once topology plan cache
//! - The [`ScheduleHandler`] answering the framework's five callbacks

pub mod fitter;
pub mod handler;
pub mod job;
pub mod resource;
pub mod session;

pub use fitter::{fit_pod, fit_pod_requests, ordered_cards};
pub use handler::{PodBinding, ScheduleHandler, ValidateFailure, TOPOLOGY_PIN_SCORE};
pub use job::{SchedulerJob, TopologyPlan, TopologyScheduleResult, XpuTask};
pub use session::{ContainerSpec, JobInfo, NodeInfo, PodInfo, Session, TaskInfo};
