use async_trait::async_trait;

use super::types::{InstallSpec, InstanceSpec, Page};
use crate::error_handling::types::ControlPlaneError;

/// Calls the daemon makes to the remote panel.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn notify_boot_start(&self) -> Result<(), ControlPlaneError>;

    /// One page of the instances assigned to this node. Pages start at 0.
    async fn fetch_instances(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<InstanceSpec>, ControlPlaneError>;

    async fn fetch_instance(&self, id: u32) -> Result<InstanceSpec, ControlPlaneError>;

    async fn fetch_install_spec(&self, id: u32) -> Result<InstallSpec, ControlPlaneError>;

    async fn report_install(&self, id: u32, successful: bool) -> Result<(), ControlPlaneError>;

    async fn notify_boot_finish(&self) -> Result<(), ControlPlaneError>;
}
