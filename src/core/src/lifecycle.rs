pub mod join_to_start;
pub mod state_machine;
pub mod types;

#[cfg(test)]
mod tests;

pub use join_to_start::JoinListener;
pub use state_machine::{StateMachine, Transition};
pub use types::{instance_state_machine, InstanceState, LifecycleAction};
