pub mod docker_cli;
pub mod parsing;
pub mod runtime_trait;
pub mod types;

#[cfg(test)]
mod tests;

pub use docker_cli::DockerCli;
pub use runtime_trait::ContainerRuntime;
pub use types::*;
