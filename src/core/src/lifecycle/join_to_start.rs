use std::io;
use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Listens on an instance's main allocation while it is held in `JoinToStart`.
///
/// The first inbound connection is closed right away and the instance id is
/// sent on the revive channel, after which the listener stops accepting.
#[derive(Debug)]
pub struct JoinListener {
    instance_id: u32,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JoinListener {
    pub async fn bind(
        instance_id: u32,
        addr: SocketAddr,
        revive: mpsc::UnboundedSender<u32>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        info!(
            "[instance {}] Waiting for a connection on {} to start",
            instance_id, local_addr
        );

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("[instance {}] Join listener closed", instance_id);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("[instance {}] Connection from {}, reviving", instance_id, peer);
                        drop(stream);
                        if revive.send(instance_id).is_err() {
                            warn!("[instance {}] Revive channel closed", instance_id);
                        }
                    }
                    Err(e) => warn!("[instance {}] Join listener failed: {}", instance_id, e),
                },
            }
        });

        Ok(Self {
            instance_id,
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listening socket and waits for the accept task to end.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(
                "[instance {}] Join listener task ended abnormally: {}",
                self.instance_id, e
            );
        }
    }
}
