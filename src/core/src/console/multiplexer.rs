use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SYSTEM_PREFIX;
use crate::configuration::ConsoleConfig;
use crate::container_runtime::AttachedStream;
use crate::error_handling::types::StreamError;
use crate::events::{Broadcaster, Subscription};

struct AttachedConsole {
    input: Box<dyn AsyncWrite + Send + Unpin>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    process: Option<Child>,
}

/// Output multiplexer of one instance.
///
/// Lines are kept in a bounded buffer; once it grows past `max_lines` the
/// oldest `eviction_batch` lines are dropped in one go. Every line not written
/// with `suppress_event` is published to all subscribers.
pub struct Console {
    instance_id: u32,
    settings: ConsoleConfig,
    lines: Mutex<VecDeque<String>>,
    observers: Broadcaster<String>,
    stream: tokio::sync::Mutex<Option<AttachedConsole>>,
}

impl Console {
    pub fn new(instance_id: u32, settings: ConsoleConfig) -> Self {
        Self {
            instance_id,
            lines: Mutex::new(VecDeque::with_capacity(settings.max_lines)),
            observers: Broadcaster::bounded(
                format!("console {}", instance_id),
                settings.viewer_queue,
            ),
            stream: tokio::sync::Mutex::new(None),
            settings,
        }
    }

    pub fn write_line(&self, content: &str, suppress_event: bool) {
        let mut lines = self.buffer();
        lines.push_back(content.to_string());
        if lines.len() > self.settings.max_lines {
            let evict = self.settings.eviction_batch.min(lines.len());
            lines.drain(..evict);
            trace!(
                "[instance {}] Evicted {} console lines",
                self.instance_id,
                evict
            );
        }
        // Published under the buffer lock so replay subscriptions see each line once.
        if !suppress_event {
            self.observers.publish(content.to_string());
        }
    }

    /// Writes a highlighted line originating from the daemon itself.
    pub fn write_system_output(&self, message: &str) {
        debug!("[instance {}] {}", self.instance_id, message);
        self.write_line(&format!("{} {}", SYSTEM_PREFIX, message), false);
    }

    pub fn get_all_log_messages(&self) -> Vec<String> {
        self.buffer().iter().cloned().collect()
    }

    /// The buffered history joined into chunks of `replay_chunk_size` lines.
    pub fn replay_chunks(&self) -> Vec<String> {
        let lines = self.buffer();
        self.chunk(&lines)
    }

    /// Subscribes a viewer. A viewer more than `viewer_queue` lines behind
    /// is disconnected.
    pub fn subscribe(&self) -> Subscription<String> {
        self.observers.subscribe()
    }

    /// Subscribes a daemon-side consumer that is never disconnected.
    pub fn subscribe_unbounded(&self) -> Subscription<String> {
        self.observers.subscribe_unbounded()
    }

    /// Subscribes a viewer that first receives the history as replay chunks,
    /// then every new line, with nothing lost or repeated in between.
    pub fn subscribe_with_replay(&self) -> Subscription<String> {
        let lines = self.buffer();
        let backlog = self.chunk(&lines);
        self.observers.subscribe_with(backlog)
    }

    pub fn unsubscribe(&self, id: uuid::Uuid) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn clear_subscribers(&self) {
        self.observers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.subscriber_count()
    }

    /// Writes `command` plus a newline to the attached stdin.
    pub async fn send_command(&self, command: &str) -> Result<(), StreamError> {
        let mut stream = self.stream.lock().await;
        let Some(attached) = stream.as_mut() else {
            warn!(
                "[instance {}] Tried to write to a console without an attached stream",
                self.instance_id
            );
            return Err(StreamError::Detached);
        };

        let mut payload = command.as_bytes().to_vec();
        payload.push(b'\n');
        attached.input.write_all(&payload).await?;
        attached.input.flush().await?;
        Ok(())
    }

    /// Wires `stream` into this console, replacing any previous stream.
    pub async fn attach(self: &Arc<Self>, stream: AttachedStream) {
        self.detach().await;

        let AttachedStream {
            output,
            input,
            process,
        } = stream;
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_output(
            Arc::downgrade(self),
            self.instance_id,
            output,
            cancel.clone(),
        ));

        *self.stream.lock().await = Some(AttachedConsole {
            input,
            cancel,
            reader,
            process,
        });
        debug!("[instance {}] Console attached", self.instance_id);
    }

    /// Stops reading output and closes stdin. Does nothing when detached.
    pub async fn detach(&self) {
        let attached = self.stream.lock().await.take();
        let Some(mut attached) = attached else {
            return;
        };

        attached.cancel.cancel();
        if let Some(process) = attached.process.as_mut() {
            if let Err(e) = process.start_kill() {
                trace!("[instance {}] Attach process already gone: {}", self.instance_id, e);
            }
        }
        if let Err(e) = attached.reader.await {
            warn!("[instance {}] Console reader failed: {}", self.instance_id, e);
        }
        debug!("[instance {}] Console detached", self.instance_id);
    }

    pub async fn is_attached(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    fn chunk(&self, lines: &VecDeque<String>) -> Vec<String> {
        let size = self.settings.replay_chunk_size.max(1);
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        lines.chunks(size).map(|chunk| chunk.join("\n")).collect()
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Splits the attached output into lines and feeds them to the console.
async fn read_output(
    console: Weak<Console>,
    instance_id: u32,
    output: Box<dyn AsyncRead + Send + Unpin>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => {
                debug!("[instance {}] Console stream reached EOF", instance_id);
                break;
            }
            Ok(_) => {
                let Some(console) = console.upgrade() else {
                    break;
                };
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                if !text.is_empty() {
                    console.write_line(text, false);
                }
            }
            Err(e) => {
                warn!("[instance {}] Console stream failed: {}", instance_id, e);
                break;
            }
        }
    }
}
