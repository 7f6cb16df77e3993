//! Live fan-out to dashboard subscribers.
//!
//! Every subscriber owns an unbounded channel. A broadcast is serialized once
//! and the same `Arc<str>` is handed to each open channel; subscribers that are
//! gone simply miss it. Dropping a [`Subscription`] is its close signal and
//! removes it from the hub.

use crate::models::Push;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Outbox = mpsc::UnboundedSender<Arc<str>>;

#[derive(Default)]
struct HubInner {
    subscribers: Mutex<HashMap<u64, Outbox>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().insert(id, tx);
        debug!(subscriber = id, "subscriber connected");

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Returns how many subscribers the message was handed to.
    pub fn broadcast(&self, push: &Push) -> usize {
        let message: Arc<str> = match serde_json::to_string(push) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("failed to serialize broadcast: {}", e);
                return 0;
            }
        };

        let subscribers = self.inner.subscribers.lock();
        subscribers
            .values()
            .filter(|tx| !tx.is_closed())
            .filter(|tx| tx.send(Arc::clone(&message)).is_ok())
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Drops every outbox; subscribers observe end-of-stream.
    pub fn close_all(&self) {
        let dropped = {
            let mut subscribers = self.inner.subscribers.lock();
            std::mem::take(&mut *subscribers)
        };
        debug!("closed {} subscribers", dropped.len());
    }
}

pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<str>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serialized message, or `None` once the hub closed this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.lock().remove(&self.id);
            debug!(subscriber = self.id, "subscriber closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ntp(at: &str) -> Push {
        Push::Ntp { now_utc: at.to_string() }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_open_subscribers() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.broadcast(&ntp("t1")), 2);

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a, got_b);
        assert!(Arc::ptr_eq(&got_a, &got_b));
        let json: serde_json::Value = serde_json::from_str(&got_a).unwrap();
        assert_eq!(json["type"], "ntp");
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let hub = BroadcastHub::new();
        let a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(a);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.broadcast(&ntp("t2")), 1);
        assert!(b.try_recv().is_some());
    }

    #[test]
    fn test_no_replay_for_late_subscribers() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.broadcast(&ntp("early")), 0);

        let mut late = hub.subscribe();
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let hub = BroadcastHub::new();
        let mut sub = hub.subscribe();
        hub.close_all();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }
}
