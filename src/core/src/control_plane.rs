pub mod control_plane_trait;
pub mod panel_client;
pub mod types;

pub use control_plane_trait::ControlPlane;
pub use panel_client::PanelClient;
pub use types::*;
