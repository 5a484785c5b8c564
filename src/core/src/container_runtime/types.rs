use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

/// Label present on every container this daemon creates.
pub const SOFTWARE_LABEL: &str = "Software";
pub const SOFTWARE_MARKER: &str = "Berth";
/// Label carrying the owning instance id.
pub const INSTANCE_LABEL: &str = "ServerId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    /// `uid:gid`
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub cap_drop: Vec<String>,
    pub dns: Vec<String>,
    /// Target path and mount options
    pub tmpfs: Vec<(String, String)>,
    pub memory_bytes: Option<u64>,
    pub memory_reservation_bytes: Option<u64>,
    /// `-1` for unlimited swap
    pub memory_swap_bytes: Option<i64>,
    pub cpu_quota: Option<u64>,
    pub cpu_period: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub blkio_weight: Option<u16>,
    pub pids_limit: Option<u64>,
    pub oom_kill_disable: bool,
    /// Keep stdin open so commands can be written to the attached stream.
    pub interactive: bool,
}

/// Subset of `inspect` / `ps` output the daemon relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    /// Instance id from the labels, when the container is ours.
    pub fn instance_id(&self) -> Option<u32> {
        owned_instance_id(&self.labels)
    }
}

/// Reads the instance id out of `labels` if the software marker is present.
pub fn owned_instance_id(labels: &HashMap<String, String>) -> Option<u32> {
    if labels.get(SOFTWARE_LABEL).map(String::as_str) != Some(SOFTWARE_MARKER) {
        return None;
    }
    labels.get(INSTANCE_LABEL)?.trim().parse().ok()
}

/// Raw entry of the runtime event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Category such as `container`, `image` or `network`.
    pub kind: String,
    pub actor_id: String,
    pub action: String,
    pub attributes: HashMap<String, String>,
}

/// Container category event as republished by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub action: String,
    pub attributes: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl ContainerEvent {
    pub fn is_die(&self) -> bool {
        self.action == "die"
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.attributes.get("exitCode")?.parse().ok()
    }

    /// Container name as carried by the event, without a leading slash.
    pub fn container_name(&self) -> Option<&str> {
        self.attributes
            .get("name")
            .map(|n| n.trim_start_matches('/'))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Resource usage sample of a running container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    pub memory_usage_mb: u64,
    pub memory_total_mb: u64,
    /// Percent of one core
    pub cpu_usage: f64,
    pub io_read_kb: u64,
    pub io_write_kb: u64,
    pub net_read_kb: u64,
    pub net_write_kb: u64,
}

/// Bidirectional stdio stream of an attached container.
///
/// `output` carries stdout and stderr merged line by line.
pub struct AttachedStream {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Client process backing the stream, killed when the stream is closed.
    pub process: Option<Child>,
}

impl fmt::Debug for AttachedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedStream")
            .field("process", &self.process.as_ref().and_then(|p| p.id()))
            .finish()
    }
}
