pub mod container_monitor;

pub use container_monitor::ContainerMonitor;
