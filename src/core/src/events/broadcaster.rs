use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use log::{trace, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Fan-out registry delivering every published value to each live subscriber.
///
/// Each subscriber owns its own queue, so values reach a given subscriber in
/// publish order and a slow or failing subscriber never holds up the others.
/// Subscribers whose receiving side went away are pruned on the next publish.
///
/// A broadcaster built with [`Broadcaster::bounded`] caps every queue; a
/// subscriber whose queue is full when a value is published is dropped and
/// sees the end of its subscription once it drains what was queued.
#[derive(Debug)]
pub struct Broadcaster<T> {
    name: String,
    capacity: Option<usize>,
    subscribers: Mutex<HashMap<Uuid, Queue<T>>>,
}

#[derive(Debug)]
enum Queue<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

impl<T> Queue<T> {
    fn deliver(&self, value: T) -> Delivery {
        match self {
            Queue::Unbounded(sender) => match sender.send(value) {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Closed,
            },
            Queue::Bounded(sender) => match sender.try_send(value) {
                Ok(()) => Delivery::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }
}

#[derive(Debug)]
enum Receiver<T> {
    Unbounded(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

/// Receiving half handed out by [`Broadcaster::subscribe`].
#[derive(Debug)]
pub struct Subscription<T> {
    id: Uuid,
    receiver: Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the next value. `None` once the broadcaster dropped this subscriber.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.receiver {
            Receiver::Unbounded(receiver) => receiver.recv().await,
            Receiver::Bounded(receiver) => receiver.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match &mut self.receiver {
            Receiver::Unbounded(receiver) => receiver.try_recv().ok(),
            Receiver::Bounded(receiver) => receiver.try_recv().ok(),
        }
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Broadcaster whose subscribers hold at most `capacity` pending values.
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: Some(capacity.max(1)),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        self.register(self.capacity, Vec::new())
    }

    /// Subscribes without a queue limit, for consumers that always keep up.
    pub fn subscribe_unbounded(&self) -> Subscription<T> {
        self.register(None, Vec::new())
    }

    /// Registers a subscriber and a task draining it into `handler`.
    ///
    /// Handler failures are logged and do not end the subscription.
    pub fn subscribe_fn<F, Fut, E>(&self, mut handler: F) -> Uuid
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display,
    {
        let mut subscription = self.subscribe();
        let id = subscription.id();
        let name = self.name.clone();
        tokio::spawn(async move {
            while let Some(value) = subscription.recv().await {
                if let Err(e) = handler(value).await {
                    warn!("[{}] subscriber {} failed: {}", name, id, e);
                }
            }
            trace!("[{}] subscriber {} finished", name, id);
        });
        id
    }

    /// Returns whether `id` was registered.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Delivers `value` to every subscriber registered at call time.
    pub fn publish(&self, value: T) {
        let mut subscribers = self.lock();
        subscribers.retain(|id, queue| match queue.deliver(value.clone()) {
            Delivery::Sent => true,
            Delivery::Full => {
                warn!(
                    "[{}] dropping subscriber {}: {} values pending",
                    self.name,
                    id,
                    self.capacity.unwrap_or_default()
                );
                false
            }
            Delivery::Closed => {
                trace!("[{}] pruning closed subscriber {}", self.name, id);
                false
            }
        });
    }

    /// Registers a subscriber after feeding it `backlog`, with no publish
    /// able to interleave. The backlog does not count against the queue limit.
    pub fn subscribe_with<I>(&self, backlog: I) -> Subscription<T>
    where
        I: IntoIterator<Item = T>,
    {
        self.register(self.capacity, backlog.into_iter().collect())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn register(&self, capacity: Option<usize>, backlog: Vec<T>) -> Subscription<T> {
        let id = Uuid::new_v4();
        let (queue, receiver) = match capacity {
            Some(capacity) => {
                let (sender, receiver) = mpsc::channel(capacity + backlog.len());
                (Queue::Bounded(sender), Receiver::Bounded(receiver))
            }
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                (Queue::Unbounded(sender), Receiver::Unbounded(receiver))
            }
        };

        let mut subscribers = self.lock();
        for value in backlog {
            // The receiver is still held and the queue has room for the backlog.
            let _ = queue.deliver(value);
        }
        subscribers.insert(id, queue);
        trace!("[{}] subscriber {} added", self.name, id);
        Subscription { id, receiver }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Queue<T>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
