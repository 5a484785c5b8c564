use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::instance::{Instance, Lifecycle, Shared};
use super::types::{InstanceSummary, PowerOutcome, StatsSubscription};
use crate::configuration::Config;
use crate::container_runtime::{
    owned_instance_id, ContainerEvent, ContainerInfo, ContainerRuntime, ResourceStats,
    SOFTWARE_LABEL,
};
use crate::control_plane::{ControlPlane, InstanceSpec};
use crate::environment::container_spec::{install_volume_path, runtime_volume_path, virtual_disk};
use crate::environment::{
    install_container_name, runtime_container_name, runtime_environment, Environment,
    EnvironmentEvent,
};
use crate::error_handling::types::{LifecycleError, RuntimeError, StreamError};
use crate::events::Subscription;
use crate::lifecycle::InstanceState;
use crate::volume::VolumePreparer;

const STATS_BUFFER: usize = 16;

/// Which environment of an instance produced an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitSource {
    Runtime { was_killed: bool },
    Install,
}

/// Registry of every instance on this node and entry point of all
/// lifecycle operations.
pub struct Orchestrator {
    shared: Shared,
    instances: RwLock<HashMap<u32, Arc<Instance>>>,
    revive_rx: Mutex<Option<mpsc::UnboundedReceiver<u32>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        control_plane: Arc<dyn ControlPlane>,
        volumes: Arc<dyn VolumePreparer>,
    ) -> Arc<Self> {
        let (revive_tx, revive_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            shared: Shared {
                config,
                runtime,
                control_plane,
                volumes,
                revive_tx,
            },
            instances: RwLock::new(HashMap::new()),
            revive_rx: Mutex::new(Some(revive_rx)),
        })
    }

    /// Spawns the tasks feeding container events and join-to-start revivals
    /// into the orchestrator. Both end once the orchestrator is dropped.
    pub fn spawn_workers(
        self: &Arc<Self>,
        mut events: Subscription<ContainerEvent>,
    ) -> Vec<JoinHandle<()>> {
        let mut workers = Vec::new();

        let weak = Arc::downgrade(self);
        workers.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move { orchestrator.handle_container_event(event).await });
            }
            debug!("Container event worker stopped");
        }));

        let revive_rx = self
            .revive_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut revive_rx) = revive_rx {
            let weak = Arc::downgrade(self);
            workers.push(tokio::spawn(async move {
                while let Some(id) = revive_rx.recv().await {
                    let Some(orchestrator) = weak.upgrade() else {
                        break;
                    };
                    tokio::spawn(async move { orchestrator.revive(id).await });
                }
                debug!("Revive worker stopped");
            }));
        }

        workers
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn get(&self, id: u32) -> Option<Arc<Instance>> {
        self.read_instances().get(&id).cloned()
    }

    pub fn state(&self, id: u32) -> Option<InstanceState> {
        self.get(id).map(|instance| instance.state())
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.read_instances().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.read_instances().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_instances().is_empty()
    }

    /// Registers a fresh, offline instance for `spec`, replacing any instance
    /// with the same id.
    pub fn add_from_spec(self: &Arc<Self>, spec: InstanceSpec) -> Arc<Instance> {
        let id = spec.id;
        let instance = Arc::new(Instance::new(spec, &self.shared.config));
        self.watch_online(&instance);

        let previous = self
            .write_instances()
            .insert(id, Arc::clone(&instance));
        if previous.is_some() {
            warn!("[instance {}] Replaced an already registered instance", id);
        }
        debug!("[instance {}] Registered", id);
        instance
    }

    /// Updates the configuration of a known instance in place, or adds it.
    pub fn sync(self: &Arc<Self>, spec: InstanceSpec) -> Arc<Instance> {
        match self.get(spec.id) {
            Some(instance) => {
                debug!("[instance {}] Configuration updated", spec.id);
                instance.update_spec(spec);
                instance
            }
            None => self.add_from_spec(spec),
        }
    }

    pub async fn sync_from_panel(self: &Arc<Self>, id: u32) -> Result<Arc<Instance>, LifecycleError> {
        let spec = self.shared.control_plane.fetch_instance(id).await?;
        Ok(self.sync(spec))
    }

    /// Unregisters every instance and drops their viewers and listeners.
    /// Containers are left untouched.
    pub async fn clear(&self) {
        let drained: Vec<Arc<Instance>> = self
            .write_instances()
            .drain()
            .map(|(_, instance)| instance)
            .collect();

        for instance in drained {
            let mut lifecycle = instance.lifecycle.lock().await;
            if let Some(listener) = lifecycle.slots.join.take() {
                listener.stop().await;
            }
            lifecycle.machine.clear_subscribers();
            drop(lifecycle);

            instance.cancel_stats();
            let console = instance.console();
            console.detach().await;
            console.clear_subscribers();
        }
    }

    pub async fn start(&self, id: u32) -> Result<PowerOutcome, LifecycleError> {
        let instance = self.require(id)?;
        self.refresh_spec(&instance).await;

        let mut lifecycle = instance.lifecycle.lock().await;
        self.apply(&instance, &mut lifecycle, InstanceState::Starting)
            .await
    }

    pub async fn stop(&self, id: u32) -> Result<PowerOutcome, LifecycleError> {
        let instance = self.require(id)?;
        let mut lifecycle = instance.lifecycle.lock().await;

        let target = match lifecycle.machine.state() {
            InstanceState::JoinToStart => InstanceState::Offline,
            InstanceState::Starting | InstanceState::Running => {
                let container_running = lifecycle
                    .slots
                    .runtime
                    .as_ref()
                    .is_some_and(Environment::is_running);
                if container_running {
                    InstanceState::Stopping
                } else {
                    InstanceState::Offline
                }
            }
            state => return Ok(PowerOutcome::Ignored(state)),
        };
        self.apply(&instance, &mut lifecycle, target).await
    }

    pub async fn kill(&self, id: u32) -> Result<PowerOutcome, LifecycleError> {
        let instance = self.require(id)?;
        let mut lifecycle = instance.lifecycle.lock().await;
        self.apply(&instance, &mut lifecycle, InstanceState::Offline)
            .await
    }

    pub async fn reinstall(&self, id: u32) -> Result<PowerOutcome, LifecycleError> {
        let instance = self.require(id)?;
        self.refresh_spec(&instance).await;

        let mut lifecycle = instance.lifecycle.lock().await;
        self.apply(&instance, &mut lifecycle, InstanceState::Installing)
            .await
    }

    /// Kills the instance, removes its containers and volumes and forgets it.
    pub async fn delete(&self, id: u32) -> Result<PowerOutcome, LifecycleError> {
        let instance = self.require(id)?;
        {
            let mut lifecycle = instance.lifecycle.lock().await;
            if lifecycle.machine.state() != InstanceState::Offline {
                if let Err(e) = instance
                    .transition(&self.shared, &mut lifecycle, InstanceState::Offline)
                    .await
                {
                    warn!("[instance {}] Forcing offline for delete: {}", id, e);
                    lifecycle.machine.set_state(InstanceState::Offline);
                }
            }

            if let Some(listener) = lifecycle.slots.join.take() {
                listener.stop().await;
            }
            lifecycle.slots.runtime = None;
            lifecycle.slots.install = None;

            for name in [runtime_container_name(id), install_container_name(id)] {
                match self.shared.runtime.remove(&name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                    Err(e) => warn!("[instance {}] Unable to remove {}: {}", id, name, e),
                }
            }
            if let Some(disk) = virtual_disk(&self.shared.config, &instance.spec()) {
                if let Err(e) = self.shared.volumes.remove_virtual_disk(&disk).await {
                    warn!(
                        "[instance {}] Unable to remove virtual disk {}: {}",
                        id,
                        disk.image.display(),
                        e
                    );
                }
            }
            for path in [
                runtime_volume_path(&self.shared.config, id),
                install_volume_path(&self.shared.config, id),
            ] {
                if let Err(e) = self.shared.volumes.remove(&path).await {
                    warn!(
                        "[instance {}] Unable to remove {}: {}",
                        id,
                        path.display(),
                        e
                    );
                }
            }
            lifecycle.machine.clear_subscribers();
        }

        self.write_instances().remove(&id);
        instance.cancel_stats();
        let console = instance.console();
        console.detach().await;
        console.clear_subscribers();
        info!("[instance {}] Deleted", id);
        Ok(PowerOutcome::Applied)
    }

    /// Marks a starting instance as running.
    pub async fn report_ready(&self, id: u32) -> Result<PowerOutcome, LifecycleError> {
        let instance = self.require(id)?;
        let mut lifecycle = instance.lifecycle.lock().await;
        if lifecycle.machine.state() != InstanceState::Starting {
            return Ok(PowerOutcome::Ignored(lifecycle.machine.state()));
        }
        self.apply(&instance, &mut lifecycle, InstanceState::Running)
            .await
    }

    /// Writes `command` to the instance's stdin.
    pub async fn send_command(&self, id: u32, command: &str) -> Result<PowerOutcome, LifecycleError> {
        let instance = self.require(id)?;
        let state = instance.state();
        if matches!(state, InstanceState::Offline | InstanceState::JoinToStart) {
            return Ok(PowerOutcome::Ignored(state));
        }

        match instance.console().send_command(command).await {
            Ok(()) => Ok(PowerOutcome::Applied),
            Err(StreamError::Detached) => Ok(PowerOutcome::Ignored(state)),
            Err(StreamError::IoError(e)) => Err(LifecycleError::IoError(e)),
        }
    }

    /// One resource sample. Zeroed while no runtime container exists.
    pub async fn stats(&self, id: u32) -> Result<ResourceStats, LifecycleError> {
        let instance = self.require(id)?;
        match instance.state() {
            InstanceState::Offline | InstanceState::Installing | InstanceState::JoinToStart => {
                Ok(ResourceStats::default())
            }
            _ => Ok(self
                .shared
                .runtime
                .stats(&runtime_container_name(id))
                .await?),
        }
    }

    /// Streams resource samples until the subscription is dropped or the
    /// instance goes offline.
    pub fn subscribe_stats(&self, id: u32) -> Result<StatsSubscription, LifecycleError> {
        let instance = self.require(id)?;
        let token = CancellationToken::new();
        let (sink, receiver) = mpsc::channel(STATS_BUFFER);

        if matches!(
            instance.state(),
            InstanceState::Offline | InstanceState::Installing | InstanceState::JoinToStart
        ) {
            token.cancel();
            return Ok(StatsSubscription::new(receiver, token));
        }

        instance.register_stats(token.clone());
        let runtime = Arc::clone(&self.shared.runtime);
        let stream_token = token.clone();
        tokio::spawn(async move {
            let name = runtime_container_name(id);
            if let Err(e) = runtime.stream_stats(&name, sink, stream_token).await {
                debug!("[instance {}] Stats stream ended: {}", id, e);
            }
        });
        Ok(StatsSubscription::new(receiver, token))
    }

    /// Summary of every instance, with stats for running ones when asked.
    pub async fn list(&self, with_stats: bool) -> Vec<InstanceSummary> {
        let mut instances: Vec<Arc<Instance>> = self.read_instances().values().cloned().collect();
        instances.sort_by_key(|instance| instance.id());

        let mut summaries = Vec::with_capacity(instances.len());
        for instance in instances {
            let state = instance.state();
            let stats = if with_stats && state == InstanceState::Running {
                match self
                    .shared
                    .runtime
                    .stats(&runtime_container_name(instance.id()))
                    .await
                {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        debug!("[instance {}] No stats: {}", instance.id(), e);
                        None
                    }
                }
            } else {
                None
            };
            summaries.push(InstanceSummary {
                id: instance.id(),
                state,
                stats,
                collected_at: Utc::now(),
            });
        }
        summaries
    }

    /// Takes over a running container found at boot without recreating it.
    pub(crate) async fn restore(&self, id: u32, info: &ContainerInfo) -> Result<(), LifecycleError> {
        let instance = self.require(id)?;
        let mut lifecycle = instance.lifecycle.lock().await;

        let mut environment = Environment::new(
            id,
            runtime_environment(&self.shared.config, &instance.spec()),
            Arc::clone(&self.shared.runtime),
            Arc::clone(&self.shared.volumes),
            instance.console(),
        );
        environment.restore(info).await?;
        lifecycle.slots.runtime = Some(environment);
        lifecycle.machine.set_state(InstanceState::Running);
        info!("[instance {}] Restored running container {}", id, info.name);
        Ok(())
    }

    /// Correlates a runtime event to its instance and applies it.
    pub async fn handle_container_event(&self, event: ContainerEvent) {
        if !event.is_die() {
            trace!("Ignoring {} event of {}", event.action, event.container_id);
            return;
        }

        let id = if event.label(SOFTWARE_LABEL).is_some() {
            owned_instance_id(&event.attributes)
        } else {
            match self.shared.runtime.inspect(&event.container_id).await {
                Ok(Some(info)) => info.instance_id(),
                Ok(None) => None,
                Err(e) => {
                    debug!("Unable to inspect {}: {}", event.container_id, e);
                    None
                }
            }
        };
        let Some(id) = id else {
            trace!("Discarding event of foreign container {}", event.container_id);
            return;
        };
        let Some(instance) = self.get(id) else {
            debug!("Discarding event for unknown instance {}", id);
            return;
        };

        let mut lifecycle = instance.lifecycle.lock().await;
        let mut exit = None;
        if let Some(environment) = lifecycle.slots.install.as_mut() {
            if let Some(EnvironmentEvent::Exited { exit_code }) = environment.observe(&event).await {
                lifecycle.slots.install_exit_code = exit_code;
                exit = Some(ExitSource::Install);
            }
        }
        if exit.is_none() {
            if let Some(environment) = lifecycle.slots.runtime.as_mut() {
                if environment.observe(&event).await.is_some() {
                    exit = Some(ExitSource::Runtime {
                        was_killed: environment.was_killed(),
                    });
                }
            }
        }

        if let Some(source) = exit {
            self.on_exit(&instance, &mut lifecycle, source).await;
        }
    }

    async fn on_exit(&self, instance: &Instance, lifecycle: &mut Lifecycle, source: ExitSource) {
        let id = instance.id();
        let state = lifecycle.machine.state();
        let result = match (state, source) {
            (InstanceState::Installing, ExitSource::Install) => {
                instance
                    .transition(&self.shared, lifecycle, InstanceState::Offline)
                    .await
            }
            (InstanceState::Stopping, ExitSource::Runtime { .. }) => {
                if instance.spec().join_to_start {
                    match instance
                        .transition(&self.shared, lifecycle, InstanceState::JoinToStart)
                        .await
                    {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            warn!("[instance {}] Unable to hold for join: {}", id, e);
                            instance
                                .transition(&self.shared, lifecycle, InstanceState::Offline)
                                .await
                        }
                    }
                } else {
                    instance
                        .transition(&self.shared, lifecycle, InstanceState::Offline)
                        .await
                }
            }
            (
                InstanceState::Starting | InstanceState::Running,
                ExitSource::Runtime { was_killed },
            ) => {
                if was_killed {
                    info!("[instance {}] Killed", id);
                } else {
                    warn!("[instance {}] Crashed while {}", id, state);
                    instance
                        .console()
                        .write_system_output("The server has crashed");
                }
                instance
                    .transition(&self.shared, lifecycle, InstanceState::Offline)
                    .await
            }
            _ => {
                trace!("[instance {}] Ignoring exit while {}", id, state);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("[instance {}] Unable to handle exit: {}", id, e);
        }
    }

    async fn revive(&self, id: u32) {
        let Some(instance) = self.get(id) else {
            return;
        };
        let mut lifecycle = instance.lifecycle.lock().await;
        if lifecycle.machine.state() != InstanceState::JoinToStart {
            return;
        }
        if let Err(e) = self
            .apply(&instance, &mut lifecycle, InstanceState::Starting)
            .await
        {
            error!("[instance {}] Unable to revive: {}", id, e);
        }
    }

    /// Runs the transition when the table allows it, ignores it otherwise.
    /// Failures are logged and written to the console.
    async fn apply(
        &self,
        instance: &Instance,
        lifecycle: &mut Lifecycle,
        to: InstanceState,
    ) -> Result<PowerOutcome, LifecycleError> {
        if !lifecycle.machine.can_transition(to) {
            return Ok(PowerOutcome::Ignored(lifecycle.machine.state()));
        }

        match instance.transition(&self.shared, lifecycle, to).await {
            Ok(()) => Ok(PowerOutcome::Applied),
            Err(e) => {
                error!(
                    "[instance {}] Transition to {} failed: {}",
                    instance.id(),
                    to,
                    e
                );
                instance
                    .console()
                    .write_system_output(&format!("Failed to change state to {}: {}", to, e));
                Err(e)
            }
        }
    }

    async fn refresh_spec(&self, instance: &Instance) {
        match self.shared.control_plane.fetch_instance(instance.id()).await {
            Ok(spec) => instance.update_spec(spec),
            Err(e) => {
                warn!(
                    "[instance {}] Unable to refresh configuration: {}",
                    instance.id(),
                    e
                );
                instance
                    .console()
                    .write_system_output("Failed to fetch server data. Trying to start anyways");
            }
        }
    }

    /// Passes every console line of `instance` to the online detector.
    fn watch_online(self: &Arc<Self>, instance: &Arc<Instance>) {
        let mut lines = instance.console().subscribe_unbounded();
        let weak: Weak<Self> = Arc::downgrade(self);
        let target = Arc::downgrade(instance);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let Some(instance) = target.upgrade() else {
                    break;
                };
                if instance.state() != InstanceState::Starting || !instance.is_online_line(&line) {
                    continue;
                }
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                let id = instance.id();
                drop(instance);
                // The transition takes the instance lock; run it off the console task.
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.report_ready(id).await {
                        warn!("[instance {}] Unable to mark as running: {}", id, e);
                    }
                });
            }
        });
    }

    fn require(&self, id: u32) -> Result<Arc<Instance>, LifecycleError> {
        self.get(id).ok_or(LifecycleError::NotFound(id))
    }

    fn read_instances(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u32, Arc<Instance>>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_instances(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u32, Arc<Instance>>> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }
}
