use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::configuration::Config;
use crate::console::Console;
use crate::container_runtime::ContainerRuntime;
use crate::control_plane::{ControlPlane, InstanceSpec};
use crate::environment::container_spec::install_volume_path;
use crate::environment::{install_environment, runtime_environment, Environment};
use crate::error_handling::types::{LifecycleError, StreamError};
use crate::events::Subscription;
use crate::lifecycle::{
    instance_state_machine, InstanceState, JoinListener, LifecycleAction, StateMachine,
};
use crate::volume::VolumePreparer;

/// Collaborators every instance action needs.
pub(crate) struct Shared {
    pub config: Arc<Config>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub volumes: Arc<dyn VolumePreparer>,
    pub revive_tx: mpsc::UnboundedSender<u32>,
}

/// Live resources bound to an instance while it is not offline.
#[derive(Default)]
pub(crate) struct EnvironmentSlots {
    pub runtime: Option<Environment>,
    pub install: Option<Environment>,
    pub join: Option<JoinListener>,
    pub install_exit_code: Option<i64>,
}

/// Everything guarded by the instance lock.
pub(crate) struct Lifecycle {
    pub machine: StateMachine<InstanceState, LifecycleAction>,
    pub slots: EnvironmentSlots,
}

/// One managed instance.
pub struct Instance {
    id: u32,
    spec: RwLock<Arc<InstanceSpec>>,
    detector: RwLock<Option<Regex>>,
    console: Arc<Console>,
    pub(crate) lifecycle: tokio::sync::Mutex<Lifecycle>,
    state: watch::Receiver<InstanceState>,
    stats_tokens: Mutex<Vec<CancellationToken>>,
}

/// Compiles the online detection pattern, matching it literally when it is
/// not a valid regular expression.
fn detector_for(pattern: &str) -> Option<Regex> {
    if pattern.trim().is_empty() {
        return None;
    }
    Regex::new(pattern)
        .or_else(|_| Regex::new(&regex::escape(pattern)))
        .ok()
}

impl Instance {
    pub(crate) fn new(spec: InstanceSpec, config: &Config) -> Self {
        let machine = instance_state_machine();
        let state = machine.watch();
        Self {
            id: spec.id,
            console: Arc::new(Console::new(spec.id, config.console.clone())),
            detector: RwLock::new(detector_for(&spec.image.online_detection)),
            spec: RwLock::new(Arc::new(spec)),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                machine,
                slots: EnvironmentSlots::default(),
            }),
            state,
            stats_tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn spec(&self) -> Arc<InstanceSpec> {
        Arc::clone(&self.spec.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the declared configuration. Takes effect on the next start.
    pub fn update_spec(&self, spec: InstanceSpec) {
        *self
            .detector
            .write()
            .unwrap_or_else(PoisonError::into_inner) = detector_for(&spec.image.online_detection);
        *self.spec.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(spec);
    }

    /// Last committed state, readable without the instance lock.
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<InstanceState> {
        self.state.clone()
    }

    pub async fn subscribe_state(&self) -> Subscription<InstanceState> {
        self.lifecycle.lock().await.machine.subscribe()
    }

    pub fn console(&self) -> Arc<Console> {
        Arc::clone(&self.console)
    }

    pub fn is_online_line(&self, line: &str) -> bool {
        self.detector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|detector| detector.is_match(line))
    }

    pub(crate) fn register_stats(&self, token: CancellationToken) {
        let mut tokens = self.stats_tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.retain(|t| !t.is_cancelled());
        tokens.push(token);
    }

    pub(crate) fn cancel_stats(&self) {
        let tokens: Vec<_> = self
            .stats_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    /// Runs the transition to `to`, executing its action. Caller holds the lock.
    pub(crate) async fn transition(
        &self,
        shared: &Shared,
        lifecycle: &mut Lifecycle,
        to: InstanceState,
    ) -> Result<(), LifecycleError> {
        let Lifecycle { machine, slots } = lifecycle;
        let context = ActionContext {
            instance: self,
            shared,
        };
        machine
            .transition_to(to, |action| async move { context.run(slots, action).await })
            .await?;

        if to == InstanceState::Offline {
            self.cancel_stats();
        }
        info!("[instance {}] Now {}", self.id, to);
        Ok(())
    }
}

/// Executes [`LifecycleAction`]s for one instance.
#[derive(Clone, Copy)]
struct ActionContext<'a> {
    instance: &'a Instance,
    shared: &'a Shared,
}

impl ActionContext<'_> {
    async fn run(
        self,
        slots: &mut EnvironmentSlots,
        action: LifecycleAction,
    ) -> Result<(), LifecycleError> {
        debug!("[instance {}] Running {:?}", self.instance.id, action);
        match action {
            LifecycleAction::BeginInstall => self.begin_install(slots).await,
            LifecycleAction::FinalizeInstall => self.finalize_install(slots).await,
            LifecycleAction::Boot => self.boot(slots).await,
            LifecycleAction::Teardown => self.teardown(slots).await,
            LifecycleAction::RequestStop => self.request_stop(slots).await,
            LifecycleAction::HoldForJoin => {
                self.teardown(slots).await?;
                self.hold_for_join(slots).await
            }
            LifecycleAction::ReleaseJoin => {
                self.release_join(slots).await;
                Ok(())
            }
            LifecycleAction::Revive => {
                self.release_join(slots).await;
                self.boot(slots).await
            }
        }
    }

    fn environment(&self, config: crate::environment::EnvironmentConfig) -> Environment {
        Environment::new(
            self.instance.id,
            config,
            Arc::clone(&self.shared.runtime),
            Arc::clone(&self.shared.volumes),
            self.instance.console(),
        )
    }

    async fn begin_install(&self, slots: &mut EnvironmentSlots) -> Result<(), LifecycleError> {
        let console = self.instance.console();
        let spec = self.instance.spec();
        console.write_system_output("Preparing for installation");

        let install = self
            .shared
            .control_plane
            .fetch_install_spec(spec.id)
            .await?;
        let install_dir = install_volume_path(&self.shared.config, spec.id);
        self.shared.volumes.ensure(&install_dir, 0, 0).await?;
        write_install_script(&install_dir, &install.script).await?;
        console.write_system_output("Fetched install script");

        let mut environment =
            self.environment(install_environment(&self.shared.config, &spec, &install));
        slots.install_exit_code = None;
        environment.recreate().await?;
        console.write_system_output("Starting installation");
        let started = environment.start().await;
        slots.install = Some(environment);
        started?;
        Ok(())
    }

    async fn finalize_install(&self, slots: &mut EnvironmentSlots) -> Result<(), LifecycleError> {
        let console = self.instance.console();
        let id = self.instance.id;

        if let Some(mut environment) = slots.install.take() {
            if environment.is_running() {
                if let Err(e) = environment.kill().await {
                    warn!("[instance {}] Unable to kill install container: {}", id, e);
                }
            }
            if let Err(e) = environment.destroy().await {
                warn!("[instance {}] Unable to remove install container: {}", id, e);
            }
        }

        console.write_system_output("Cleaning up install volume");
        let install_dir = install_volume_path(&self.shared.config, id);
        if let Err(e) = self.shared.volumes.remove(&install_dir).await {
            warn!("[instance {}] Unable to remove install volume: {}", id, e);
        }

        let successful = slots.install_exit_code.take() == Some(0);
        if successful {
            console.write_system_output("Installation completed");
        } else {
            console.write_system_output("Installation failed");
        }
        if let Err(e) = self.shared.control_plane.report_install(id, successful).await {
            warn!("[instance {}] Unable to report install result: {}", id, e);
        }
        Ok(())
    }

    async fn boot(&self, slots: &mut EnvironmentSlots) -> Result<(), LifecycleError> {
        let spec = self.instance.spec();
        let mut environment = self.environment(runtime_environment(&self.shared.config, &spec));
        let result = match environment.recreate().await {
            Ok(()) => environment.start().await,
            Err(e) => Err(e),
        };
        slots.runtime = Some(environment);
        result.map_err(LifecycleError::from)
    }

    async fn teardown(&self, slots: &mut EnvironmentSlots) -> Result<(), LifecycleError> {
        if let Some(environment) = slots.runtime.as_mut() {
            if environment.is_running() {
                environment.kill().await?;
            }
            self.instance.console().detach().await;
        }
        Ok(())
    }

    async fn request_stop(&self, slots: &mut EnvironmentSlots) -> Result<(), LifecycleError> {
        let spec = self.instance.spec();
        let stop = spec.image.stop_command.trim();

        if let Some(signal) = stop.strip_prefix('^') {
            let signal = match signal {
                "C" => "SIGINT",
                other => other,
            };
            if let Some(environment) = slots.runtime.as_mut() {
                environment.signal(signal).await?;
            }
            return Ok(());
        }

        match self.instance.console().send_command(stop).await {
            Ok(()) | Err(StreamError::Detached) => Ok(()),
            Err(StreamError::IoError(e)) => Err(LifecycleError::IoError(e)),
        }
    }

    async fn hold_for_join(&self, slots: &mut EnvironmentSlots) -> Result<(), LifecycleError> {
        let spec = self.instance.spec();
        let ip = spec
            .main_allocation
            .ip
            .as_deref()
            .unwrap_or(&self.shared.config.docker.host_bind_ip);
        let ip: IpAddr = ip.parse().map_err(|e| {
            LifecycleError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid allocation address {}: {}", ip, e),
            ))
        })?;
        let addr = SocketAddr::new(ip, spec.main_allocation.port);

        let listener =
            JoinListener::bind(self.instance.id, addr, self.shared.revive_tx.clone()).await?;
        self.instance
            .console()
            .write_system_output("Waiting for a player to join");
        slots.join = Some(listener);
        Ok(())
    }

    async fn release_join(&self, slots: &mut EnvironmentSlots) {
        if let Some(listener) = slots.join.take() {
            listener.stop().await;
        }
    }
}

async fn write_install_script(dir: &Path, script: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("install.sh");
    tokio::fs::write(&path, script).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await
}
