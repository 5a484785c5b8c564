pub mod boot;
pub mod configuration;
pub mod console;
pub mod container_runtime;
pub mod control_plane;
pub mod environment;
pub mod error_handling;
pub mod events;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_support;
