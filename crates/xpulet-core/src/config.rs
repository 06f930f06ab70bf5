//! Plugin configuration and framework argument parsing

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::SchedResult;

/// Argument key enabling whole-card topology scheduling.
pub const ARG_TOPOLOGY_ENABLE: &str = "TopologyEnable";
/// Argument key enabling the single-NUMA preference.
pub const ARG_NUMA_ENABLE: &str = "NumaEnable";
/// Argument key disabling the handshake freshness check.
pub const ARG_TEST_ENABLE: &str = "TestEnable";
/// Argument key for the comma-separated node list of the bandwidth matrix.
pub const ARG_TOPOLOGY_NODE_LIST: &str = "TopologyNodeList";
/// Argument key for the node-to-node bandwidth matrix.
pub const ARG_TOPOLOGY_NODE_BANDWIDTH: &str = "TopologyNodeBandwidth";

/// Feature switches recognized by the scheduler plugin.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Enable whole-card topology scheduling
    #[serde(default)]
    pub topology_enable: bool,
    /// Prefer card pickings that stay on one NUMA node
    #[serde(default)]
    pub numa_enable: bool,
    /// Skip the node handshake freshness check
    #[serde(default)]
    pub test_enable: bool,
}

/// Free-form string arguments handed over by the hosting framework's
/// plugin configuration.
#[derive(Debug, Clone, Default)]
pub struct PluginArguments(HashMap<String, String>);

impl PluginArguments {
    pub fn new(args: HashMap<String, String>) -> Self {
        Self(args)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse a boolean argument; absent or unparsable values leave the
    /// target untouched.
    pub fn get_bool(&self, key: &str, target: &mut bool) {
        if let Some(value) = self.0.get(key) {
            if let Ok(parsed) = value.parse() {
                *target = parsed;
            }
        }
    }

    /// The feature switches carried in these arguments.
    pub fn plugin_config(&self) -> PluginConfig {
        let mut config = PluginConfig::default();
        self.get_bool(ARG_TOPOLOGY_ENABLE, &mut config.topology_enable);
        self.get_bool(ARG_NUMA_ENABLE, &mut config.numa_enable);
        self.get_bool(ARG_TEST_ENABLE, &mut config.test_enable);
        config
    }
}

impl FromIterator<(String, String)> for PluginArguments {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// On-disk scheduler configuration, the TOML mirror of the framework
/// arguments for hosts that configure from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Feature switches
    #[serde(default)]
    pub plugin: PluginConfig,
    /// Node-to-node bandwidth inputs
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
}

/// The node list and matrix strings in the same wire shape the framework
/// arguments use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Comma-separated node names, the authoritative matrix ordering
    #[serde(default)]
    pub node_list: String,
    /// Rows `;`-separated, cells `,`-separated decimal bandwidth
    #[serde(default)]
    pub node_matrix: String,
}

impl SchedulerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> SchedResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Flatten into the framework argument shape.
    pub fn arguments(&self) -> PluginArguments {
        let mut args = HashMap::new();
        args.insert(
            ARG_TOPOLOGY_ENABLE.to_string(),
            self.plugin.topology_enable.to_string(),
        );
        args.insert(
            ARG_NUMA_ENABLE.to_string(),
            self.plugin.numa_enable.to_string(),
        );
        args.insert(
            ARG_TEST_ENABLE.to_string(),
            self.plugin.test_enable.to_string(),
        );
        if !self.bandwidth.node_list.is_empty() {
            args.insert(
                ARG_TOPOLOGY_NODE_LIST.to_string(),
                self.bandwidth.node_list.clone(),
            );
            args.insert(
                ARG_TOPOLOGY_NODE_BANDWIDTH.to_string(),
                self.bandwidth.node_matrix.clone(),
            );
        }
        PluginArguments::new(args)
    }
}
