//! The event/log hub fans out lines of text to any number of subscribers.
//!
//! Log output and connection status events are published here,
//! and the log websocket subscribes.
//!
//! A single actor task owns the subscriber map.
//! Publishing never blocks: it goes into the actor's unbounded inbox.
//! Each subscriber has its own bounded queue, and a subscriber that lets
//! its queue fill up is dropped rather than slowing everyone else down.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::Error;

/// Queue capacity per subscriber, unless configured otherwise.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Identifies a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Subscriber {
    queue: mpsc::Sender<Bytes>,
    overrun: Arc<AtomicBool>,
}

#[derive(Debug)]
enum HubMessage {
    Register(SubscriberId, Subscriber),
    Unregister(SubscriberId),
    Publish(Bytes),
}

/// A handle to the hub.
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct HubHandle {
    messages: mpsc::UnboundedSender<HubMessage>,
    capacity: usize,
}

impl HubHandle {
    /// Start the hub.
    /// Subscribers get queues holding `capacity` messages.
    ///
    /// The hub runs until every handle is gone.
    pub fn spawn(capacity: usize) -> Self {
        let (messages, inbox) = mpsc::unbounded_channel();

        let hub = Hub {
            inbox,
            subscribers: HashMap::new(),
        };

        tokio::spawn(hub.run().instrument(info_span!("hub")));

        Self { messages, capacity }
    }

    /// Send something to every subscriber.
    ///
    /// Never blocks.
    pub fn publish(&self, message: impl Into<Bytes>) {
        // Nobody to deliver to if the hub is gone.
        let _ = self.messages.send(HubMessage::Publish(message.into()));
    }

    /// Subscribe with the hub's default queue capacity.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.capacity)
    }

    /// Subscribe with a specific queue capacity.
    ///
    /// Only messages published after this call are received.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = SubscriberId::new();
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let overrun = Arc::new(AtomicBool::new(false));

        let _ = self.messages.send(HubMessage::Register(
            id,
            Subscriber {
                queue,
                overrun: overrun.clone(),
            },
        ));

        Subscription {
            id,
            receiver,
            overrun,
            hub: self.clone(),
        }
    }

    /// Stop delivering to a subscriber.
    /// Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.messages.send(HubMessage::Unregister(id));
    }
}

/// Receives what is published on the hub.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Bytes>,
    overrun: Arc<AtomicBool>,
    hub: HubHandle,
}

impl Subscription {
    /// This subscriber's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The next published message.
    ///
    /// `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Wait for at least one message, then take everything else already queued too.
    /// The messages are joined by newlines.
    ///
    /// `None` once the hub has dropped this subscriber.
    pub async fn next_batch(&mut self) -> Option<Bytes> {
        let first = self.receiver.recv().await?;

        let mut batch = BytesMut::from(&first[..]);
        while let Ok(next) = self.receiver.try_recv() {
            batch.put_u8(b'\n');
            batch.extend_from_slice(&next);
        }

        Some(batch.freeze())
    }

    /// Whether the hub dropped this subscriber for not keeping up.
    pub fn overrun(&self) -> bool {
        self.overrun.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

struct Hub {
    inbox: mpsc::UnboundedReceiver<HubMessage>,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

impl Hub {
    async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            match message {
                HubMessage::Register(id, subscriber) => {
                    debug!(%id, "Subscriber registered");
                    self.subscribers.insert(id, subscriber);
                }
                HubMessage::Unregister(id) => {
                    if self.subscribers.remove(&id).is_some() {
                        debug!(%id, "Subscriber unregistered");
                    }
                }
                HubMessage::Publish(message) => self.publish(message),
            }
        }

        debug!("Hub stopped");
    }

    // Do not log per message here, the log output itself comes through this path.
    fn publish(&mut self, message: Bytes) {
        self.subscribers
            .retain(|id, subscriber| match subscriber.queue.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    subscriber.overrun.store(true, Ordering::SeqCst);
                    warn!(%id, "{}, dropping it", Error::SubscriberOverrun);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }
}
