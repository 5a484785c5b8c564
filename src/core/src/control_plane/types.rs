use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Host address to bind; the daemon's bind address when absent.
    #[serde(default)]
    pub ip: Option<String>,
    pub port: u16,
}

fn default_pids_limit() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    /// Percent of one core, 100 = one full core
    pub cpu: u64,
    /// MB
    pub memory: u64,
    /// MB
    pub disk: u64,
    /// Enforce `disk` with a loop-mounted image over the runtime volume
    #[serde(default)]
    pub use_virtual_disk: bool,
    #[serde(default)]
    pub disable_swap: bool,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u64,
    #[serde(default)]
    pub enable_oom_kill: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub docker_image: String,
    /// Written to stdin to stop gracefully, or a signal when it starts with `^`.
    pub stop_command: String,
    /// Pattern marking the instance as ready when it appears in the console.
    #[serde(default)]
    pub online_detection: String,
    #[serde(default = "default_true")]
    pub pull_image: bool,
}

/// Declared configuration of one instance, as served by the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub id: u32,
    pub startup_command: String,
    pub main_allocation: Allocation,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    pub limits: Limits,
    pub image: ImageSpec,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub join_to_start: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSpec {
    pub docker_image: String,
    pub shell: String,
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub successful: bool,
}
