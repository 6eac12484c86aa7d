use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::metrics::Metric;

fn default_metric_plugin() -> String {
    "hdeem_sync_plugin".to_string()
}

/// Agent configuration file. Everything is optional; the defaults match
/// an HDEEM-instrumented machine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Measurement plugin used for energy requests.
    #[serde(default = "default_metric_plugin")]
    pub metric_plugin: String,
    /// Overrides for the plugin-side energy metric names.
    #[serde(default)]
    pub node_energy: Option<String>,
    #[serde(default)]
    pub cpu0_energy: Option<String>,
    #[serde(default)]
    pub cpu1_energy: Option<String>,
    /// Call-tree node id of the application's main entry, prefixed to
    /// node-addressed tuning requests when set.
    #[serde(default)]
    pub main_id: Option<u32>,
    /// Phase region name; the command line takes precedence.
    #[serde(default)]
    pub phase: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            metric_plugin: default_metric_plugin(),
            node_energy: None,
            cpu0_energy: None,
            cpu1_energy: None,
            main_id: None,
            phase: None,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<AgentConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Plugin-side name for an energy metric, honoring overrides.
    pub fn energy_metric_name(&self, metric: Metric) -> Option<String> {
        let x86 = self.metric_plugin == "x86_energy";
        match metric {
            Metric::NodeEnergy => Some(self.node_energy.clone().unwrap_or_else(|| {
                if x86 { "x86_energy/BLADE/E" } else { "hdeem/BLADE/E" }.to_string()
            })),
            Metric::Cpu0Energy => Some(self.cpu0_energy.clone().unwrap_or_else(|| {
                if x86 { "x86_energy/CORE0" } else { "hdeem/CPU0/E" }.to_string()
            })),
            Metric::Cpu1Energy => Some(self.cpu1_energy.clone().unwrap_or_else(|| {
                if x86 { "x86_energy/CORE1" } else { "hdeem/CPU1/E" }.to_string()
            })),
            _ => None,
        }
    }
}
