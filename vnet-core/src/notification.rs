//! A publish/subscribe channel for lifecycle events.
//!
//! The bus is an ordinary value: whoever needs to publish or subscribe is
//! handed a clone. Subscribers open a [`NotificationQueue`] which only sees
//! events published while it is alive and unsubscribes when dropped.

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// What happened, such as `node.updated`.
    pub action: String,
    /// The subject of the event.
    pub event: Value,
    /// Additional information for consumers.
    pub extra: Map<String, Value>,
}

/// A cloneable handle to a notification channel. Clones publish to and
/// subscribe from the same channel.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    notify: broadcast::Sender<Notification>,
}

impl NotificationBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (notify, _) = broadcast::channel(capacity.max(1));
        Self { notify }
    }

    /// Sends an event to every open queue.
    pub fn publish(&self, action: &str, event: impl Serialize) {
        self.publish_with(action, event, Map::new())
    }

    pub fn publish_with(&self, action: &str, event: impl Serialize, extra: Map<String, Value>) {
        let event = match serde_json::to_value(event) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(action, "Failed to serialize notification: {}", e);
                return;
            }
        };
        let notification = Notification {
            action: action.to_string(),
            event,
            extra,
        };
        if self.notify.send(notification).is_err() {
            tracing::trace!(action, "No subscribers for notification");
        }
    }

    /// Opens a subscriber queue.
    pub fn queue(&self) -> NotificationQueue {
        NotificationQueue {
            receiver: self.notify.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.notify.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A subscription to a [`NotificationBus`], delivering events in the order
/// they were published.
#[derive(Debug)]
pub struct NotificationQueue {
    receiver: broadcast::Receiver<Notification>,
}

impl NotificationQueue {
    /// Waits up to `timeout` for the next event.
    pub async fn get(&mut self, timeout: Duration) -> Option<Notification> {
        tokio::time::timeout(timeout, self.next()).await.ok().flatten()
    }

    /// Waits for the next event. Returns `None` once every bus handle is gone.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => return Some(notification),
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notification queue lagged, {} events dropped", skipped)
                }
            }
        }
    }

    /// Returns an event if one is already waiting.
    pub fn try_get(&mut self) -> Option<Notification> {
        use broadcast::error::TryRecvError;
        loop {
            match self.receiver.try_recv() {
                Ok(notification) => return Some(notification),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
