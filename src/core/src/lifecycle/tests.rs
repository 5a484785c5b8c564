use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::error_handling::types::TransitionError;

fn ok(_: LifecycleAction) -> std::future::Ready<Result<(), String>> {
    std::future::ready(Ok(()))
}

#[tokio::test]
async fn starts_offline_with_full_table() {
    let machine = instance_state_machine();

    assert_eq!(machine.state(), InstanceState::Offline);
    assert!(machine.can_transition(InstanceState::Starting));
    assert!(machine.can_transition(InstanceState::Installing));
    assert!(!machine.can_transition(InstanceState::Running));
    assert!(!machine.can_transition(InstanceState::Stopping));
}

#[tokio::test]
async fn illegal_transition_leaves_state_unchanged() {
    let mut machine = instance_state_machine();
    let calls = AtomicUsize::new(0);

    let result = machine
        .transition_to(InstanceState::Running, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<(), String>(()))
        })
        .await;

    match result {
        Err(TransitionError::IllegalState { from, to }) => {
            assert_eq!(from, InstanceState::Offline);
            assert_eq!(to, InstanceState::Running);
        }
        other => panic!("expected IllegalState, got {:?}", other),
    }
    assert_eq!(machine.state(), InstanceState::Offline);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn action_runs_once_with_declared_tag() {
    let mut machine = instance_state_machine();
    let mut seen = Vec::new();

    machine
        .transition_to(InstanceState::Starting, |action| {
            seen.push(action);
            std::future::ready(Ok::<(), String>(()))
        })
        .await
        .expect("offline -> starting");
    machine
        .transition_to(InstanceState::Running, |action| {
            seen.push(action);
            std::future::ready(Ok::<(), String>(()))
        })
        .await
        .expect("starting -> running");

    assert_eq!(seen, vec![LifecycleAction::Boot]);
    assert_eq!(machine.state(), InstanceState::Running);
}

#[tokio::test]
async fn failing_action_prevents_commit() {
    let mut machine = instance_state_machine();
    let mut observer = machine.subscribe();

    let result = machine
        .transition_to(InstanceState::Starting, |_| {
            std::future::ready(Err::<(), _>(String::from("pull failed")))
        })
        .await;

    assert!(matches!(result, Err(TransitionError::Action(ref e)) if e == "pull failed"));
    assert_eq!(machine.state(), InstanceState::Offline);
    assert!(observer.try_recv().is_none());
}

#[tokio::test]
async fn every_observer_sees_each_commit_once() {
    let mut machine = instance_state_machine();
    let mut first = machine.subscribe();
    let mut second = machine.subscribe();

    machine.transition_to(InstanceState::Starting, ok).await.expect("start");
    machine.transition_to(InstanceState::Running, ok).await.expect("ready");

    for observer in [&mut first, &mut second] {
        assert_eq!(observer.try_recv(), Some(InstanceState::Starting));
        assert_eq!(observer.try_recv(), Some(InstanceState::Running));
        assert_eq!(observer.try_recv(), None);
    }
}

#[tokio::test]
async fn dropped_observer_does_not_block_commit() {
    let mut machine = instance_state_machine();
    drop(machine.subscribe());
    let mut live = machine.subscribe();

    machine.transition_to(InstanceState::Starting, ok).await.expect("start");

    assert_eq!(machine.state(), InstanceState::Starting);
    assert_eq!(live.try_recv(), Some(InstanceState::Starting));
}

#[tokio::test]
async fn set_state_skips_table_and_updates_watch() {
    let mut machine = instance_state_machine();
    let watch = machine.watch();
    let mut observer = machine.subscribe();

    machine.set_state(InstanceState::Running);

    assert_eq!(machine.state(), InstanceState::Running);
    assert_eq!(*watch.borrow(), InstanceState::Running);
    assert_eq!(observer.try_recv(), Some(InstanceState::Running));
}

#[tokio::test]
async fn stop_paths_reach_join_to_start_and_back() {
    let mut machine = instance_state_machine();
    let mut actions = Vec::new();

    for target in [
        InstanceState::Starting,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::JoinToStart,
        InstanceState::Starting,
    ] {
        machine
            .transition_to(target, |action| {
                actions.push(action);
                std::future::ready(Ok::<(), String>(()))
            })
            .await
            .unwrap_or_else(|e| panic!("{}", e));
    }

    assert_eq!(
        actions,
        vec![
            LifecycleAction::Boot,
            LifecycleAction::RequestStop,
            LifecycleAction::HoldForJoin,
            LifecycleAction::Revive,
        ]
    );
}

#[tokio::test]
async fn join_listener_revives_on_first_connection() {
    let (revive_tx, mut revive_rx) = mpsc::unbounded_channel();
    let listener = JoinListener::bind(42, "127.0.0.1:0".parse().unwrap(), revive_tx)
        .await
        .expect("bind join listener");

    let _client = tokio::net::TcpStream::connect(listener.local_addr())
        .await
        .expect("connect");

    let revived = tokio::time::timeout(Duration::from_secs(2), revive_rx.recv())
        .await
        .expect("revive signal");
    assert_eq!(revived, Some(42));
    listener.stop().await;
}

#[tokio::test]
async fn stopped_join_listener_frees_the_port() {
    let (revive_tx, mut revive_rx) = mpsc::unbounded_channel();
    let listener = JoinListener::bind(7, "127.0.0.1:0".parse().unwrap(), revive_tx)
        .await
        .expect("bind join listener");
    let addr = listener.local_addr();

    listener.stop().await;

    let rebound = tokio::net::TcpListener::bind(addr).await;
    assert!(rebound.is_ok());
    assert!(revive_rx.try_recv().is_err());
}

#[tokio::test]
async fn watch_mirror_is_shared_between_readers() {
    let mut machine = instance_state_machine();
    let readers: Vec<_> = (0..3).map(|_| machine.watch()).collect();

    machine.transition_to(InstanceState::Installing, ok).await.expect("install");

    for reader in readers {
        assert_eq!(*reader.borrow(), InstanceState::Installing);
    }
}
