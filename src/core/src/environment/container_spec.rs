use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::configuration::Config;
use crate::container_runtime::{
    ContainerSpec, Mount, PortBinding, Protocol, INSTANCE_LABEL, SOFTWARE_LABEL, SOFTWARE_MARKER,
};
use crate::control_plane::{InstallSpec, InstanceSpec};
use crate::volume::VirtualDisk;

const DROPPED_CAPABILITIES: [&str; 10] = [
    "setpcap",
    "mknod",
    "audit_write",
    "net_raw",
    "dac_override",
    "fowner",
    "fsetid",
    "net_bind_service",
    "sys_chroot",
    "setfcap",
];
const BYTES_PER_MB: u64 = 1_000_000;
const CPU_PERIOD: u64 = 100_000;
const CPU_SHARES: u64 = 1024;
const BLKIO_WEIGHT: u16 = 100;
const RUNTIME_WORKDIR: &str = "/home/container";
const INSTALL_SERVER_DIR: &str = "/mnt/server";
const INSTALL_SCRIPT_DIR: &str = "/mnt/install";

/// What an [`super::Environment`] needs to (re)create its container.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentConfig {
    pub container: ContainerSpec,
    /// Host directories that must exist before the container is created.
    pub volumes: Vec<PathBuf>,
    pub uid: u32,
    pub gid: u32,
    pub pull_image: bool,
    /// Mounted over the runtime volume before the volumes are prepared.
    pub virtual_disk: Option<VirtualDisk>,
}

pub fn runtime_container_name(id: u32) -> String {
    format!("berth-runtime-{}", id)
}

pub fn install_container_name(id: u32) -> String {
    format!("berth-install-{}", id)
}

pub fn runtime_volume_path(config: &Config, id: u32) -> PathBuf {
    config.paths.volumes.join(id.to_string())
}

pub fn install_volume_path(config: &Config, id: u32) -> PathBuf {
    config.paths.install.join(id.to_string())
}

/// The disk capping the runtime volume, when the instance asks for one.
pub fn virtual_disk(config: &Config, spec: &InstanceSpec) -> Option<VirtualDisk> {
    spec.limits.use_virtual_disk.then(|| VirtualDisk {
        image: config.paths.disks.join(format!("{}.img", spec.id)),
        mount_point: runtime_volume_path(config, spec.id),
        size_mb: spec.limits.disk,
        filesystem: config.server.virtual_disk_filesystem.clone(),
    })
}

/// Variables exposed to the workload: startup command, memory, ports and
/// the instance's own template variables.
pub fn environment_variables(spec: &InstanceSpec) -> Vec<(String, String)> {
    let mut env = vec![
        (String::from("STARTUP"), spec.startup_command.clone()),
        (String::from("SERVER_MEMORY"), spec.limits.memory.to_string()),
        (
            String::from("SERVER_PORT"),
            spec.main_allocation.port.to_string(),
        ),
    ];
    for (index, allocation) in spec.allocations.iter().enumerate() {
        env.push((format!("BERTH_PORT_{}", index), allocation.port.to_string()));
    }
    for (key, value) in &spec.variables {
        env.push((key.clone(), value.clone()));
    }
    env
}

fn labels(id: u32) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(SOFTWARE_LABEL.to_string(), SOFTWARE_MARKER.to_string());
    labels.insert(INSTANCE_LABEL.to_string(), id.to_string());
    labels
}

fn port_bindings(config: &Config, spec: &InstanceSpec) -> Vec<PortBinding> {
    let mut allocations = spec.allocations.clone();
    if !allocations
        .iter()
        .any(|a| a.port == spec.main_allocation.port)
    {
        allocations.insert(0, spec.main_allocation.clone());
    }

    allocations
        .iter()
        .flat_map(|allocation| {
            let host_ip = allocation
                .ip
                .clone()
                .unwrap_or_else(|| config.docker.host_bind_ip.clone());
            [Protocol::Tcp, Protocol::Udp].map(|protocol| PortBinding {
                container_port: allocation.port,
                protocol,
                host_ip: host_ip.clone(),
                host_port: allocation.port,
            })
        })
        .collect()
}

/// Limits, isolation and networking shared by runtime and install containers.
fn base_container(config: &Config, spec: &InstanceSpec, name: String, image: String) -> ContainerSpec {
    let memory = spec.limits.memory as f64;
    let memory_limit = memory + memory * config.server.memory_overhead_multiplier;
    let swap = if config.server.enable_swap && !spec.limits.disable_swap {
        let swap_mb = memory_limit + memory_limit * config.server.swap_multiplier;
        (swap_mb as i64).saturating_mul(BYTES_PER_MB as i64)
    } else {
        -1
    };

    ContainerSpec {
        hostname: name.clone(),
        name,
        image,
        labels: labels(spec.id),
        ports: port_bindings(config, spec),
        cap_drop: DROPPED_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        dns: config.docker.dns_servers.clone(),
        tmpfs: vec![(
            String::from("/tmp"),
            format!("rw,exec,nosuid,size={}M", config.docker.tmpfs_size_mb),
        )],
        memory_bytes: Some((memory_limit as u64).saturating_mul(BYTES_PER_MB)),
        memory_reservation_bytes: Some(spec.limits.memory.saturating_mul(BYTES_PER_MB)),
        memory_swap_bytes: Some(swap),
        cpu_quota: (spec.limits.cpu > 0).then(|| spec.limits.cpu * 1000),
        cpu_period: Some(CPU_PERIOD),
        cpu_shares: Some(CPU_SHARES),
        blkio_weight: Some(BLKIO_WEIGHT),
        pids_limit: Some(spec.limits.pids_limit),
        oom_kill_disable: !spec.limits.enable_oom_kill,
        interactive: true,
        ..Default::default()
    }
}

/// Environment of the long running workload container.
pub fn runtime_environment(config: &Config, spec: &InstanceSpec) -> EnvironmentConfig {
    let volume = runtime_volume_path(config, spec.id);
    let mut container = base_container(
        config,
        spec,
        runtime_container_name(spec.id),
        spec.image.docker_image.clone(),
    );
    container.env = environment_variables(spec);
    container.user = Some(format!("{}:{}", config.server.uid, config.server.gid));
    container.working_dir = Some(RUNTIME_WORKDIR.to_string());
    container.mounts = vec![Mount {
        source: volume.clone(),
        target: RUNTIME_WORKDIR.to_string(),
        read_only: false,
    }];

    EnvironmentConfig {
        container,
        volumes: vec![volume],
        uid: config.server.uid,
        gid: config.server.gid,
        pull_image: spec.image.pull_image,
        virtual_disk: virtual_disk(config, spec),
    }
}

/// Environment of the one-shot install container. Runs as root with the
/// runtime volume at `/mnt/server` and the script at `/mnt/install`.
pub fn install_environment(
    config: &Config,
    spec: &InstanceSpec,
    install: &InstallSpec,
) -> EnvironmentConfig {
    let server_volume = runtime_volume_path(config, spec.id);
    let install_volume = install_volume_path(config, spec.id);
    let mut container = base_container(
        config,
        spec,
        install_container_name(spec.id),
        install.docker_image.clone(),
    );
    container.env = environment_variables(spec);
    container.user = Some(String::from("0:0"));
    container.working_dir = Some(INSTALL_SERVER_DIR.to_string());
    container.command = vec![
        install.shell.clone(),
        format!("{}/install.sh", INSTALL_SCRIPT_DIR),
    ];
    container.mounts = vec![
        Mount {
            source: server_volume.clone(),
            target: INSTALL_SERVER_DIR.to_string(),
            read_only: false,
        },
        Mount {
            source: install_volume.clone(),
            target: INSTALL_SCRIPT_DIR.to_string(),
            read_only: false,
        },
    ];

    EnvironmentConfig {
        container,
        volumes: vec![server_volume, install_volume],
        uid: 0,
        gid: 0,
        pull_image: true,
        virtual_disk: virtual_disk(config, spec),
    }
}
