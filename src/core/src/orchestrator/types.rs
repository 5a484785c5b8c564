use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::container_runtime::ResourceStats;
use crate::lifecycle::InstanceState;

/// Result of a power operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOutcome {
    Applied,
    /// Not possible from the contained state; nothing was done.
    Ignored(InstanceState),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: u32,
    pub state: InstanceState,
    pub stats: Option<ResourceStats>,
    pub collected_at: DateTime<Utc>,
}

/// Live resource samples of one instance.
///
/// The stream ends when the instance goes offline or the subscription is
/// cancelled; dropping the subscription cancels it.
#[derive(Debug)]
pub struct StatsSubscription {
    receiver: mpsc::Receiver<ResourceStats>,
    token: CancellationToken,
}

impl StatsSubscription {
    pub(crate) fn new(receiver: mpsc::Receiver<ResourceStats>, token: CancellationToken) -> Self {
        Self { receiver, token }
    }

    pub async fn recv(&mut self) -> Option<ResourceStats> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            sample = self.receiver.recv() => sample,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for StatsSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
