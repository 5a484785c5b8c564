//! In-memory collaborators shared by the unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::configuration::Config;
use crate::container_runtime::{
    AttachedStream, ContainerEvent, ContainerInfo, ContainerRuntime, ContainerSpec, ResourceStats,
    RuntimeEvent,
};
use crate::control_plane::{Allocation, ControlPlane, ImageSpec, InstallSpec, InstanceSpec, Limits, Page};
use crate::error_handling::types::{ControlPlaneError, RuntimeError};
use crate::volume::{VirtualDisk, VolumePreparer};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn instance_spec(id: u32) -> InstanceSpec {
    InstanceSpec {
        id,
        startup_command: String::from("java -jar server.jar"),
        main_allocation: Allocation {
            ip: Some(String::from("127.0.0.1")),
            port: 0,
        },
        allocations: Vec::new(),
        limits: Limits {
            cpu: 100,
            memory: 1024,
            disk: 4096,
            use_virtual_disk: false,
            disable_swap: false,
            pids_limit: 100,
            enable_oom_kill: false,
        },
        image: ImageSpec {
            docker_image: String::from("ghcr.io/berth/java:17"),
            stop_command: String::from("stop"),
            online_detection: String::from(r"Done \(.*\)!"),
            pull_image: true,
        },
        variables: BTreeMap::new(),
        join_to_start: false,
    }
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.paths.volumes = root.join("volumes");
    config.paths.install = root.join("install");
    config.paths.disks = root.join("disks");
    config
}

pub fn die_event(container_name: &str, labels: &[(&str, &str)], exit_code: i64) -> ContainerEvent {
    let mut attributes: HashMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    attributes.insert(String::from("name"), container_name.to_string());
    attributes.insert(String::from("exitCode"), exit_code.to_string());
    ContainerEvent {
        container_id: format!("id-{}", container_name),
        action: String::from("die"),
        attributes,
        received_at: chrono::Utc::now(),
    }
}

/// Container runtime keeping containers in a map.
///
/// Workload output can be injected with [`MockRuntime::emit`]; commands
/// written to an attached stdin are readable through [`MockRuntime::read_input`].
#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, ContainerInfo>>,
    created: Mutex<Vec<ContainerSpec>>,
    calls: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    outputs: tokio::sync::Mutex<HashMap<String, DuplexStream>>,
    inputs: tokio::sync::Mutex<HashMap<String, DuplexStream>>,
    event_scripts: Mutex<VecDeque<Result<Vec<RuntimeEvent>, RuntimeError>>>,
    pub event_subscriptions: AtomicUsize,
    pub active_stats_streams: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_stats: AtomicBool,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    delay: Mutex<Duration>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let runtime = Self::default();
        *runtime.delay.lock().unwrap() = delay;
        Arc::new(runtime)
    }

    pub fn insert_container(&self, info: ContainerInfo) {
        self.containers.lock().unwrap().insert(info.name.clone(), info);
    }

    pub fn set_logs(&self, name: &str, lines: &[&str]) {
        self.logs
            .lock()
            .unwrap()
            .insert(name.to_string(), lines.iter().map(|l| l.to_string()).collect());
    }

    pub fn push_event_script(&self, script: Result<Vec<RuntimeEvent>, RuntimeError>) {
        self.event_scripts.lock().unwrap().push_back(script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    /// Writes a line of workload output to the attached stream of `name`.
    pub async fn emit(&self, name: &str, line: &str) {
        let mut outputs = self.outputs.lock().await;
        let stream = outputs.get_mut(name).expect("container attached");
        stream
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("emit output");
    }

    /// Reads whatever was written to the stdin of `name` so far.
    pub async fn read_input(&self, name: &str) -> String {
        use tokio::io::AsyncReadExt;
        let mut inputs = self.inputs.lock().await;
        let stream = inputs.get_mut(name).expect("container attached");
        let mut buf = vec![0u8; 1024];
        let read = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
        match read {
            Ok(Ok(n)) => String::from_utf8_lossy(&buf[..n]).into_owned(),
            _ => String::new(),
        }
    }

    async fn enter(&self, call: String) {
        self.calls.lock().unwrap().push(call);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn missing(name: &str) -> RuntimeError {
        RuntimeError::NotFound(format!("No such container: {}", name))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .get(name)
            .or_else(|| containers.values().find(|c| c.id == name))
            .cloned())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.enter(format!("create {}", spec.name)).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: String::from("docker create"),
                status: Some(125),
                stderr: String::from("image not found"),
            });
        }
        let id = format!("id-{}", spec.name);
        self.created.lock().unwrap().push(spec.clone());
        self.insert_container(ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            running: false,
            labels: spec.labels.clone().into_iter().collect(),
        });
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.enter(format!("start {}", name)).await;
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.running = true;
        Ok(())
    }

    async fn kill(&self, name: &str, signal: Option<&str>) -> Result<(), RuntimeError> {
        self.enter(format!("kill {} {}", name, signal.unwrap_or("SIGKILL"))).await;
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        if signal.is_none() {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().push(format!("remove {}", name));
        self.outputs.lock().await.remove(name);
        self.inputs.lock().await.remove(name);
        match self.containers.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(Self::missing(name)),
        }
    }

    async fn attach(&self, name: &str) -> Result<AttachedStream, RuntimeError> {
        self.calls.lock().unwrap().push(format!("attach {}", name));
        if !self.containers.lock().unwrap().contains_key(name) {
            return Err(Self::missing(name));
        }
        let (output, workload_output) = tokio::io::duplex(16 * 1024);
        let (input, workload_input) = tokio::io::duplex(16 * 1024);
        self.outputs
            .lock()
            .await
            .insert(name.to_string(), workload_output);
        self.inputs
            .lock()
            .await
            .insert(name.to_string(), workload_input);
        Ok(AttachedStream {
            output: Box::new(output),
            input: Box::new(input),
            process: None,
        })
    }

    async fn pull(
        &self,
        image: &str,
        progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().push(format!("pull {}", image));
        progress(&format!("{}: Pulling from library", image));
        progress("Status: Image is up to date");
        Ok(())
    }

    async fn stats(&self, name: &str) -> Result<ResourceStats, RuntimeError> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(Self::missing(name));
        }
        Ok(ResourceStats {
            memory_usage_mb: 256,
            memory_total_mb: 1075,
            cpu_usage: 12.5,
            ..Default::default()
        })
    }

    async fn stream_stats(
        &self,
        name: &str,
        sink: mpsc::Sender<ResourceStats>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.active_stats_streams.fetch_add(1, Ordering::SeqCst);
        loop {
            let sample = self.stats(name).await?;
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = sink.send(sample) => if sent.is_err() { break },
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        self.active_stats_streams.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        Ok(self.containers.lock().unwrap().values().cloned().collect())
    }

    async fn logs(&self, name: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self.logs.lock().unwrap().get(name).cloned().unwrap_or_default())
    }

    async fn events(
        &self,
        sink: mpsc::Sender<RuntimeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        self.event_subscriptions.fetch_add(1, Ordering::SeqCst);
        let script = self.event_scripts.lock().unwrap().pop_front();
        match script {
            Some(Ok(events)) => {
                for event in events {
                    if sink.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    }
}

/// Control plane serving specs from memory and recording every call.
#[derive(Default)]
pub struct MockControlPlane {
    specs: Mutex<BTreeMap<u32, InstanceSpec>>,
    pub calls: Mutex<Vec<String>>,
    pub reports: Mutex<Vec<(u32, bool)>>,
    pub fail_boot_start: AtomicBool,
    pub fail_fetch: AtomicBool,
    delay: Mutex<Duration>,
}

impl MockControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, spec: InstanceSpec) {
        self.specs.lock().unwrap().insert(spec.id, spec);
    }

    /// Delays every page fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn unreachable() -> ControlPlaneError {
        ControlPlaneError::Unreachable(String::from("connection refused"))
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn notify_boot_start(&self) -> Result<(), ControlPlaneError> {
        self.record(String::from("boot_start"));
        if self.fail_boot_start.load(Ordering::SeqCst) {
            return Err(Self::unreachable());
        }
        Ok(())
    }

    async fn fetch_instances(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<InstanceSpec>, ControlPlaneError> {
        self.record(format!("fetch_instances {}", page));
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::unreachable());
        }
        let specs: Vec<InstanceSpec> = self.specs.lock().unwrap().values().cloned().collect();
        let size = page_size.max(1) as usize;
        let total_pages = specs.len().div_ceil(size) as u32;
        let items = specs
            .into_iter()
            .skip(page as usize * size)
            .take(size)
            .collect();
        Ok(Page {
            items,
            page,
            total_pages,
        })
    }

    async fn fetch_instance(&self, id: u32) -> Result<InstanceSpec, ControlPlaneError> {
        self.record(format!("fetch_instance {}", id));
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::unreachable());
        }
        self.specs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ControlPlaneError::Status {
                path: format!("api/servers/{}", id),
                code: 404,
            })
    }

    async fn fetch_install_spec(&self, id: u32) -> Result<InstallSpec, ControlPlaneError> {
        self.record(format!("fetch_install_spec {}", id));
        Ok(InstallSpec {
            docker_image: String::from("ghcr.io/berth/installer:debian"),
            shell: String::from("bash"),
            script: String::from("curl -o server.jar https://example.com/server.jar"),
        })
    }

    async fn report_install(&self, id: u32, successful: bool) -> Result<(), ControlPlaneError> {
        self.record(format!("report_install {}", id));
        self.reports.lock().unwrap().push((id, successful));
        Ok(())
    }

    async fn notify_boot_finish(&self) -> Result<(), ControlPlaneError> {
        self.record(String::from("boot_finish"));
        Ok(())
    }
}

/// Volume preparer creating plain directories without changing ownership.
#[derive(Default)]
pub struct MockVolumes {
    pub ensured: Mutex<Vec<(PathBuf, u32, u32)>>,
    pub removed: Mutex<Vec<PathBuf>>,
    pub disks_ensured: Mutex<Vec<VirtualDisk>>,
    pub disks_removed: Mutex<Vec<VirtualDisk>>,
    pub fail_remove: AtomicBool,
}

impl MockVolumes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl VolumePreparer for MockVolumes {
    async fn ensure(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await?;
        self.ensured
            .lock()
            .unwrap()
            .push((path.to_path_buf(), uid, gid));
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.removed.lock().unwrap().push(path.to_path_buf());
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "volume busy"));
        }
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn ensure_virtual_disk(&self, disk: &VirtualDisk) -> io::Result<()> {
        tokio::fs::create_dir_all(&disk.mount_point).await?;
        self.disks_ensured.lock().unwrap().push(disk.clone());
        Ok(())
    }

    async fn remove_virtual_disk(&self, disk: &VirtualDisk) -> io::Result<()> {
        self.disks_removed.lock().unwrap().push(disk.clone());
        Ok(())
    }
}
