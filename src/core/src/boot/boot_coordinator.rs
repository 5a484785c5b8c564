use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::container_runtime::{ContainerInfo, ContainerRuntime};
use crate::control_plane::ControlPlane;
use crate::environment::runtime_container_name;
use crate::error_handling::types::BootError;
use crate::orchestrator::Orchestrator;

/// Counts of a completed boot sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootReport {
    pub instances: usize,
    pub restored: usize,
}

/// Rebuilds the registry from the panel and takes over containers that
/// survived a daemon restart.
pub struct BootCoordinator {
    orchestrator: Arc<Orchestrator>,
    control_plane: Arc<dyn ControlPlane>,
    runtime: Arc<dyn ContainerRuntime>,
    page_size: u32,
    booting: AtomicBool,
}

/// Clears the booting flag when the sequence ends, however it ends.
struct BootingGuard<'a>(&'a AtomicBool);

impl Drop for BootingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BootCoordinator {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        control_plane: Arc<dyn ControlPlane>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let page_size = orchestrator.config().remote.page_size;
        Self {
            orchestrator,
            control_plane,
            runtime,
            page_size,
            booting: AtomicBool::new(false),
        }
    }

    pub fn is_booting(&self) -> bool {
        self.booting.load(Ordering::SeqCst)
    }

    /// Runs the boot sequence. A call made while another one is in progress
    /// returns [`BootError::AlreadyBooting`] without doing anything.
    pub async fn boot(&self) -> Result<BootReport, BootError> {
        if self
            .booting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Boot requested while already booting, ignoring");
            return Err(BootError::AlreadyBooting);
        }
        let _guard = BootingGuard(&self.booting);

        info!("Booting");
        let result = self.run().await;
        match &result {
            Ok(report) => info!(
                "Boot finished, {} instances registered, {} restored",
                report.instances, report.restored
            ),
            Err(e) => error!("Boot failed: {}", e),
        }
        result
    }

    async fn run(&self) -> Result<BootReport, BootError> {
        self.control_plane.notify_boot_start().await?;
        self.orchestrator.clear().await;

        let mut report = BootReport::default();
        let mut page = 0;
        loop {
            let fetched = self
                .control_plane
                .fetch_instances(page, self.page_size)
                .await?;
            debug!(
                "Fetched page {} of {} with {} instances",
                page + 1,
                fetched.total_pages,
                fetched.items.len()
            );
            for spec in fetched.items {
                self.orchestrator.add_from_spec(spec);
                report.instances += 1;
            }
            page += 1;
            if page >= fetched.total_pages {
                break;
            }
        }

        for container in self.runtime.list().await? {
            if self.restore(&container).await {
                report.restored += 1;
            }
        }

        self.control_plane.notify_boot_finish().await?;
        Ok(report)
    }

    /// Restores `container` when it is the running runtime container of a
    /// registered instance.
    async fn restore(&self, container: &ContainerInfo) -> bool {
        let Some(id) = container.instance_id() else {
            return false;
        };
        if !container.running || container.name != runtime_container_name(id) {
            debug!("Not restoring {}", container.name);
            return false;
        }
        if self.orchestrator.get(id).is_none() {
            warn!(
                "Container {} belongs to instance {} which is not assigned to this node",
                container.name, id
            );
            return false;
        }

        match self.orchestrator.restore(id, container).await {
            Ok(()) => true,
            Err(e) => {
                error!("[instance {}] Unable to restore {}: {}", id, container.name, e);
                false
            }
        }
    }
}
