use std::fmt::Debug;
use std::future::Future;

use log::trace;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error_handling::types::TransitionError;
use crate::events::{Broadcaster, Subscription};

/// A declared edge of a [`StateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, A> {
    pub from: S,
    pub to: S,
    pub action: Option<A>,
}

/// Finite-state engine over a closed set of states.
///
/// Only declared `(from, to)` pairs may be taken. Each transition may carry an
/// action tag that the caller turns into work through the executor passed to
/// [`StateMachine::transition_to`]. The machine itself is not synchronised;
/// callers serialise access (the orchestrator keeps it behind the instance
/// lock) while read-only callers use [`StateMachine::watch`].
#[derive(Debug)]
pub struct StateMachine<S, A> {
    state: S,
    transitions: Vec<Transition<S, A>>,
    observers: Broadcaster<S>,
    mirror: watch::Sender<S>,
}

impl<S, A> StateMachine<S, A>
where
    S: Copy + Eq + Debug + Send + Sync + 'static,
    A: Copy + Debug,
{
    pub fn new(initial: S) -> Self {
        let (mirror, _) = watch::channel(initial);
        Self {
            state: initial,
            transitions: Vec::new(),
            observers: Broadcaster::new("state-machine"),
            mirror,
        }
    }

    pub fn with_transition(mut self, from: S, to: S, action: Option<A>) -> Self {
        self.add_transition(from, to, action);
        self
    }

    pub fn add_transition(&mut self, from: S, to: S, action: Option<A>) {
        self.transitions.push(Transition { from, to, action });
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Receiver always holding the last committed state.
    pub fn watch(&self) -> watch::Receiver<S> {
        self.mirror.subscribe()
    }

    pub fn subscribe(&self) -> Subscription<S> {
        self.observers.subscribe()
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn clear_subscribers(&self) {
        self.observers.clear();
    }

    pub fn can_transition(&self, to: S) -> bool {
        self.find(to).is_some()
    }

    /// Moves to `to` if the edge from the current state is declared.
    ///
    /// The edge's action, if any, is handed to `run` and awaited exactly once.
    /// The new state is committed and published only when it succeeds; on
    /// failure the machine stays where it was and the error is returned.
    pub async fn transition_to<F, Fut, E>(
        &mut self,
        to: S,
        run: F,
    ) -> Result<(), TransitionError<S, E>>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let from = self.state;
        let transition = self
            .find(to)
            .ok_or(TransitionError::IllegalState { from, to })?;

        if let Some(action) = transition.action {
            trace!("Running {:?} for {:?} -> {:?}", action, from, to);
            run(action).await.map_err(TransitionError::Action)?;
        }

        self.commit(to);
        Ok(())
    }

    /// Overwrites the state without checking the table or running an action.
    pub fn set_state(&mut self, to: S) {
        self.commit(to);
    }

    fn commit(&mut self, to: S) {
        trace!("State {:?} -> {:?}", self.state, to);
        self.state = to;
        self.mirror.send_replace(to);
        self.observers.publish(to);
    }

    fn find(&self, to: S) -> Option<Transition<S, A>> {
        self.transitions
            .iter()
            .find(|t| t.from == self.state && t.to == to)
            .copied()
    }
}
