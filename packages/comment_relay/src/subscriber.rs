//! Downstream consumers of a comment stream.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The subscriber is alive but not keeping up
    #[error("subscriber queue is full")]
    Full,
    /// The subscriber will never accept another payload
    #[error("subscriber is gone")]
    Gone,
}

/// Something comments can be delivered to.
///
/// `deliver` is called with the registry slot locked, so it must not block.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    fn deliver(&self, payload: &str) -> Result<(), DeliveryError>;

    /// Told once when the relay drops this subscriber on its own.
    fn detach(&self, reason: &str);
}

/// Receiving side of a [`ChannelSubscriber`].
pub struct SubscriberFeed {
    pub comments: mpsc::Receiver<String>,
    pub detached: oneshot::Receiver<String>,
}

/// [`Subscriber`] backed by a bounded queue.
pub struct ChannelSubscriber {
    id: SubscriberId,
    tx: mpsc::Sender<String>,
    detach_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl ChannelSubscriber {
    pub fn new(capacity: usize) -> (Self, SubscriberFeed) {
        let (tx, comments) = mpsc::channel(capacity.max(1));
        let (detach_tx, detached) = oneshot::channel();
        let subscriber = Self {
            id: SubscriberId::new(),
            tx,
            detach_tx: Mutex::new(Some(detach_tx)),
        };
        (subscriber, SubscriberFeed { comments, detached })
    }
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.tx.try_send(payload.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Gone,
        })
    }

    fn detach(&self, reason: &str) {
        let sender = self
            .detach_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(reason.to_string());
        }
    }
}
