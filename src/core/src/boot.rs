pub mod boot_coordinator;

pub use boot_coordinator::{BootCoordinator, BootReport};
