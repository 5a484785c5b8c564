pub mod container_spec;
pub mod instance_environment;

pub use container_spec::{
    install_container_name, install_environment, runtime_container_name, runtime_environment,
    virtual_disk, EnvironmentConfig,
};
pub use instance_environment::{Environment, EnvironmentEvent};
