use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Container engine settings shared by every instance.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Path or name of the `docker` client binary
    pub binary: String,
    /// Address host ports are published on
    pub host_bind_ip: String,
    pub dns_servers: Vec<String>,
    /// Size of the `/tmp` tmpfs mounted into every container, in MB
    pub tmpfs_size_mb: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: String::from("docker"),
            host_bind_ip: String::from("0.0.0.0"),
            dns_servers: Vec::new(),
            tmpfs_size_mb: 100,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent directory of the per instance runtime volumes
    pub volumes: PathBuf,
    /// Parent directory of the per instance install volumes
    pub install: PathBuf,
    /// Parent directory of the virtual disk images
    pub disks: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            volumes: PathBuf::from("/var/lib/berth/volumes"),
            install: PathBuf::from("/var/lib/berth/install"),
            disks: PathBuf::from("/var/lib/berth/disks"),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Extra memory granted on top of the declared limit, as a fraction
    pub memory_overhead_multiplier: f64,
    pub enable_swap: bool,
    pub swap_multiplier: f64,
    /// Owner of runtime volumes and user the workload runs as
    pub uid: u32,
    pub gid: u32,
    /// Filesystem virtual disks are formatted with
    pub virtual_disk_filesystem: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            memory_overhead_multiplier: 0.05,
            enable_swap: true,
            swap_multiplier: 2.0,
            uid: 998,
            gid: 998,
            virtual_disk_filesystem: String::from("ext4"),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub token: String,
    /// Number of instance specifications requested per page during boot
    pub page_size: u32,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::from("http://localhost:5132/"),
            token: String::new(),
            page_size: 50,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Upper bound of buffered output lines per instance
    pub max_lines: usize,
    /// Lines dropped at once when the buffer overflows
    pub eviction_batch: usize,
    /// Lines per message when replaying history to a new viewer
    pub replay_chunk_size: usize,
    /// Messages a viewer may fall behind before it is disconnected
    pub viewer_queue: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            max_lines: 1000,
            eviction_batch: 500,
            replay_chunk_size: 20,
            viewer_queue: 1024,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub reconnect_backoff_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: 3,
        }
    }
}
