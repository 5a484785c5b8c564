use std::sync::Arc;

use log::{debug, info, warn};

use super::container_spec::EnvironmentConfig;
use crate::console::Console;
use crate::container_runtime::{ContainerEvent, ContainerInfo, ContainerRuntime};
use crate::error_handling::types::RuntimeError;
use crate::volume::VolumePreparer;

/// Outcome of feeding a runtime event to an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    Exited { exit_code: Option<i64> },
}

/// Binding between one declared container configuration and the container
/// actually running it.
///
/// The container name is deterministic, so an environment can always find
/// and replace a container left over from an earlier run.
pub struct Environment {
    instance_id: u32,
    config: EnvironmentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<dyn VolumePreparer>,
    console: Arc<Console>,
    container_id: Option<String>,
    running: bool,
    killed: bool,
}

impl Environment {
    pub fn new(
        instance_id: u32,
        config: EnvironmentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<dyn VolumePreparer>,
        console: Arc<Console>,
    ) -> Self {
        Self {
            instance_id,
            config,
            runtime,
            volumes,
            console,
            container_id: None,
            running: false,
            killed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.container.name
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the container went down through [`Environment::kill`].
    pub fn was_killed(&self) -> bool {
        self.killed
    }

    /// Replaces any existing container of this name with a fresh one and
    /// attaches the console to it.
    pub async fn recreate(&mut self) -> Result<(), RuntimeError> {
        let name = self.name().to_string();

        if self.runtime.inspect(&name).await?.is_some() {
            self.console.detach().await;
            self.console
                .write_system_output("Removing previous container");
            self.runtime.remove(&name).await?;
        }

        if let Some(disk) = &self.config.virtual_disk {
            self.console.write_system_output("Checking virtual disk");
            self.volumes
                .ensure_virtual_disk(disk)
                .await
                .map_err(RuntimeError::IoError)?;
        }

        self.console
            .write_system_output("Checking volumes and file permissions");
        for volume in &self.config.volumes {
            self.volumes
                .ensure(volume, self.config.uid, self.config.gid)
                .await
                .map_err(RuntimeError::IoError)?;
        }

        if self.config.pull_image {
            let image = self.config.container.image.clone();
            self.console.write_system_output("Downloading docker image");
            let console = Arc::clone(&self.console);
            let progress = move |line: &str| console.write_system_output(line);
            self.runtime.pull(&image, &progress).await?;
            self.console.write_system_output("Downloaded docker image");
        }

        self.console.write_system_output("Creating container");
        let id = self.runtime.create(&self.config.container).await?;
        debug!(
            "[instance {}] Created container {} ({})",
            self.instance_id, name, id
        );
        self.container_id = Some(id);
        self.running = false;
        self.killed = false;

        let stream = self.runtime.attach(&name).await?;
        self.console.attach(stream).await;
        Ok(())
    }

    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        self.runtime.start(self.name()).await?;
        self.running = true;
        info!("[instance {}] Started {}", self.instance_id, self.name());
        Ok(())
    }

    /// Operator kill: SIGKILL and remember that the exit was requested.
    pub async fn kill(&mut self) -> Result<(), RuntimeError> {
        self.killed = true;
        match self.runtime.kill(self.name(), None).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.running = false;
        Ok(())
    }

    /// Graceful stop through a signal, such as `SIGINT`.
    pub async fn signal(&mut self, signal: &str) -> Result<(), RuntimeError> {
        self.runtime.kill(self.name(), Some(signal)).await
    }

    /// Takes over an already running container after a daemon restart.
    ///
    /// Its persisted output is replayed into the console without notifying
    /// viewers, then the console is attached to the live stream.
    pub async fn restore(&mut self, info: &ContainerInfo) -> Result<(), RuntimeError> {
        self.container_id = Some(info.id.clone());
        self.running = info.running;
        self.killed = false;

        match self.runtime.logs(self.name()).await {
            Ok(lines) => {
                for line in lines.iter().filter(|l| !l.is_empty()) {
                    self.console.write_line(line, true);
                }
            }
            Err(e) => warn!(
                "[instance {}] Unable to replay logs of {}: {}",
                self.instance_id,
                self.name(),
                e
            ),
        }

        let stream = self.runtime.attach(self.name()).await?;
        self.console.attach(stream).await;
        Ok(())
    }

    /// Once the container id is known only that id matches. The name is
    /// reused on every recreate, so a late event from a replaced container
    /// would otherwise be taken for the current one.
    fn owns(&self, event: &ContainerEvent) -> bool {
        match self.container_id.as_deref() {
            Some(id) => id == event.container_id,
            None => event.container_name() == Some(self.name()),
        }
    }

    /// Applies a runtime event addressed to this environment's container.
    /// Events for any other container are ignored.
    pub async fn observe(&mut self, event: &ContainerEvent) -> Option<EnvironmentEvent> {
        if !self.owns(event) || !event.is_die() {
            return None;
        }

        self.running = false;
        self.console.detach().await;
        let exit_code = event.exit_code();
        debug!(
            "[instance {}] Container {} exited with {:?}",
            self.instance_id,
            self.name(),
            exit_code
        );
        Some(EnvironmentEvent::Exited { exit_code })
    }

    /// Detaches and force-removes the container. A missing container is fine.
    pub async fn destroy(&mut self) -> Result<(), RuntimeError> {
        self.console.detach().await;
        match self.runtime.remove(self.name()).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.running = false;
        self.container_id = None;
        Ok(())
    }
}
