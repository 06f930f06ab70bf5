//! Error types for xpulet

use thiserror::Error;

/// Main error type for xpulet
#[derive(Error, Debug)]
pub enum SchedError {
    /// Topology allocator exhausted its search
    #[error("cannot allocate")]
    CannotAllocate,

    /// Fractional fitter could not satisfy a pod on a node
    #[error("no fit on node: {0}")]
    NoFitOnNode(String),

    /// Cached topology plan disagrees with the node chosen by the framework
    #[error("topology plan mismatch: planned node {planned}, chosen node {chosen}")]
    PlanMismatch { planned: String, chosen: String },

    /// Node topology annotation malformed or out of size bounds
    #[error("bad topology: {0}")]
    BadTopology(String),

    /// Bandwidth matrix does not line up with its name list
    #[error("bad bandwidth matrix: {0}")]
    BadBandwidthMatrix(String),

    /// Device annotation malformed
    #[error("bad device annotation: {0}")]
    BadDeviceAnnotation(String),

    /// Container core request is not a multiple of the split granularity
    #[error("container {container} requests {cores} cores, not a multiple of the core step")]
    InvalidCoreRequest { container: String, cores: u32 },

    /// Device list handed to the fitter is not densely indexed
    #[error("xpu device index error on node {0}")]
    InvalidDeviceIndex(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for xpulet operations
pub type SchedResult<T> = Result<T, SchedError>;

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}
