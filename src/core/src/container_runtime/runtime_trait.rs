use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{AttachedStream, ContainerInfo, ContainerSpec, ResourceStats, RuntimeEvent};
use crate::error_handling::types::RuntimeError;

/// Operations the daemon needs from the host container engine.
///
/// Containers are addressed by name or id interchangeably.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `None` when no such container exists.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    /// Creates the container and returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Sends `signal` (default SIGKILL) to the container's main process.
    async fn kill(&self, name: &str, signal: Option<&str>) -> Result<(), RuntimeError>;

    /// Force-removes the container.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Attaches to the container's stdio. A created container that is not
    /// running yet may be started by this call; a later `start` is then a no-op.
    async fn attach(&self, name: &str) -> Result<AttachedStream, RuntimeError>;

    /// Pulls `image`, calling `progress` with every status line.
    async fn pull(
        &self,
        image: &str,
        progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<(), RuntimeError>;

    async fn stats(&self, name: &str) -> Result<ResourceStats, RuntimeError>;

    /// Streams samples into `sink` until `cancel` fires, the sink closes or the
    /// container goes away.
    async fn stream_stats(
        &self,
        name: &str,
        sink: mpsc::Sender<ResourceStats>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError>;

    /// All containers, running or not.
    async fn list(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Persisted output of the container, oldest line first.
    async fn logs(&self, name: &str) -> Result<Vec<String>, RuntimeError>;

    /// Feeds the global event stream into `sink` until it ends, fails or
    /// `cancel` fires.
    async fn events(
        &self,
        sink: mpsc::Sender<RuntimeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError>;
}
