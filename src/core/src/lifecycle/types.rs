use std::fmt;

use serde::{Deserialize, Serialize};

use super::state_machine::StateMachine;

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Offline,
    Installing,
    Starting,
    Running,
    Stopping,
    /// Held after a graceful stop until a player connects to the main allocation.
    JoinToStart,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Offline => "Offline",
            InstanceState::Installing => "Installing",
            InstanceState::Starting => "Starting",
            InstanceState::Running => "Running",
            InstanceState::Stopping => "Stopping",
            InstanceState::JoinToStart => "JoinToStart",
        };
        write!(f, "{}", name)
    }
}

/// Work attached to a transition of the instance state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Prepare volumes, fetch the script and start the install container.
    BeginInstall,
    /// Remove the install container and volume, report the outcome.
    FinalizeInstall,
    /// Recreate and start the runtime container.
    Boot,
    /// Kill the runtime container if it still runs and detach from it.
    Teardown,
    /// Send the stop command or stop signal.
    RequestStop,
    /// Tear down, then listen on the main allocation.
    HoldForJoin,
    ReleaseJoin,
    /// Stop listening, then boot again.
    Revive,
}

/// Builds a state machine in `Offline` carrying the full instance transition table.
pub fn instance_state_machine() -> StateMachine<InstanceState, LifecycleAction> {
    use InstanceState::*;
    use LifecycleAction::*;

    StateMachine::new(Offline)
        .with_transition(Offline, Installing, Some(BeginInstall))
        .with_transition(Installing, Offline, Some(FinalizeInstall))
        .with_transition(Offline, Starting, Some(Boot))
        .with_transition(Starting, Running, None)
        .with_transition(Starting, Offline, Some(Teardown))
        .with_transition(Running, Offline, Some(Teardown))
        .with_transition(Starting, Stopping, Some(RequestStop))
        .with_transition(Running, Stopping, Some(RequestStop))
        .with_transition(Stopping, Offline, Some(Teardown))
        .with_transition(Stopping, JoinToStart, Some(HoldForJoin))
        .with_transition(JoinToStart, Offline, Some(ReleaseJoin))
        .with_transition(JoinToStart, Starting, Some(Revive))
}
