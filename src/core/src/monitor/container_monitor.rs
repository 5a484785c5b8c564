use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configuration::MonitorConfig;
use crate::container_runtime::{ContainerEvent, ContainerRuntime, RuntimeEvent};
use crate::events::{Broadcaster, Subscription};

const EVENT_BUFFER: usize = 256;

/// Keeps a subscription to the runtime's global event feed open and
/// republishes container events to every subscriber.
///
/// The monitor does not know about instances; correlation happens in the
/// orchestrator.
pub struct ContainerMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    backoff: Duration,
    events: Broadcaster<ContainerEvent>,
    shutdown: CancellationToken,
}

impl ContainerMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            backoff: Duration::from_secs(config.reconnect_backoff_secs),
            events: Broadcaster::new("container-monitor"),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> Subscription<ContainerEvent> {
        self.events.subscribe()
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run().await })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Runs until [`ContainerMonitor::shutdown`] is called, resubscribing
    /// after `backoff` whenever the feed ends or fails.
    pub async fn run(&self) {
        info!("Container monitor started");
        loop {
            let (sink, mut feed) = mpsc::channel(EVENT_BUFFER);
            let subscription = self.runtime.events(sink, self.shutdown.clone());
            let pump = async {
                while let Some(event) = feed.recv().await {
                    self.dispatch(event);
                }
            };

            let (result, ()) = tokio::join!(subscription, pump);
            if self.shutdown.is_cancelled() {
                break;
            }
            match result {
                Ok(()) => warn!("Container event feed ended, reconnecting in {:?}", self.backoff),
                Err(e) => warn!(
                    "Container event feed failed: {}, reconnecting in {:?}",
                    e, self.backoff
                ),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
        debug!("Container monitor stopped");
    }

    fn dispatch(&self, event: RuntimeEvent) {
        if event.kind != "container" {
            return;
        }
        trace!("Container {} {}", event.actor_id, event.action);
        self.events.publish(ContainerEvent {
            container_id: event.actor_id,
            action: event.action,
            attributes: event.attributes,
            received_at: Utc::now(),
        });
    }
}
