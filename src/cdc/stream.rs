//! Change stream
//!
//! Fans committed change records out to per-collection subscribers. Each
//! subscriber owns a bounded channel; publishing never blocks. Delivery is
//! best effort: events that do not fit are dropped for that subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::event::Cdc;
use crate::error::{DbError, DbResult};

/// Subscribes to every collection
pub const ALL_COLLECTIONS: &str = "*";

/// What to drop when a subscriber's channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Lagging receivers skip the oldest events
    #[default]
    DropOldest,
    /// New events are discarded while the channel is full
    RejectNewest,
}

/// Outcome of one publish
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    pub matched: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

enum Sender {
    Broadcast(broadcast::Sender<Cdc>),
    Bounded(mpsc::Sender<Cdc>),
}

struct Subscriber {
    id: u64,
    sender: Sender,
}

enum Outcome {
    Delivered,
    Dropped,
    Closed,
}

impl Subscriber {
    fn send(&self, cdc: &Cdc) -> Outcome {
        match &self.sender {
            Sender::Broadcast(tx) => {
                if tx.receiver_count() == 0 {
                    return Outcome::Closed;
                }
                // a full ring evicts the oldest event for the lagging receiver
                match tx.send(cdc.clone()) {
                    Ok(_) => Outcome::Delivered,
                    Err(_) => Outcome::Closed,
                }
            }
            Sender::Bounded(tx) => match tx.try_send(cdc.clone()) {
                Ok(()) => Outcome::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => Outcome::Dropped,
                Err(mpsc::error::TrySendError::Closed(_)) => Outcome::Closed,
            },
        }
    }
}

/// Per-collection publish/subscribe of change records
pub struct ChangeStream {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    capacity: usize,
    policy: OverflowPolicy,
    next_id: AtomicU64,
}

impl ChangeStream {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Opens a subscription on `collection`, or on every collection with
    /// [`ALL_COLLECTIONS`]
    pub fn subscribe(&self, collection: &str) -> ChangeSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = match self.policy {
            OverflowPolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(self.capacity);
                (Sender::Broadcast(tx), Receiver::Broadcast(rx))
            }
            OverflowPolicy::RejectNewest => {
                let (tx, rx) = mpsc::channel(self.capacity);
                (Sender::Bounded(tx), Receiver::Bounded(rx))
            }
        };
        self.subscribers
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        debug!(target: "docudb::cdc", collection = %collection, subscriber = id, "subscribed");
        ChangeSubscription {
            id,
            collection: collection.to_string(),
            receiver,
        }
    }

    /// Delivers `cdc` to subscribers of its collection and of every collection
    pub fn publish(&self, cdc: &Cdc) -> PublishResult {
        let mut result = PublishResult::default();
        let mut closed: Vec<(String, u64)> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            let keys = [cdc.collection.as_str(), ALL_COLLECTIONS];
            for key in keys {
                let Some(list) = subscribers.get(key) else {
                    continue;
                };
                for subscriber in list {
                    result.matched += 1;
                    match subscriber.send(cdc) {
                        Outcome::Delivered => result.delivered += 1,
                        Outcome::Dropped => {
                            result.dropped += 1;
                            warn!(
                                target: "docudb::cdc",
                                collection = %cdc.collection,
                                subscriber = subscriber.id,
                                document_id = %cdc.document_id,
                                "change event dropped, subscriber channel full"
                            );
                        }
                        Outcome::Closed => closed.push((key.to_string(), subscriber.id)),
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for (key, id) in &closed {
                if let Some(list) = subscribers.get_mut(key) {
                    list.retain(|s| s.id != *id);
                    if list.is_empty() {
                        subscribers.remove(key);
                    }
                }
            }
            result.pruned = closed.len();
        }
        result
    }

    /// Spawns a task invoking `handler` with the collection name and record
    /// for each change on `collection`.
    ///
    /// Must be called within a tokio runtime. The task stops when the
    /// returned handle is cancelled or dropped.
    pub fn on_change<H>(&self, collection: &str, mut handler: H) -> DbResult<ChangeStreamTask>
    where
        H: FnMut(&str, &Cdc) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| DbError::validation("on_change requires a tokio runtime"))?;
        let mut subscription = self.subscribe(collection);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = subscription.recv() => match event {
                        Some(cdc) => handler(&cdc.collection, &cdc),
                        None => break,
                    },
                }
            }
        });
        Ok(ChangeStreamTask {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }

    /// Drops every subscriber; their receivers observe the end of the stream
    pub fn close(&self) {
        self.subscribers.write().clear();
    }
}

impl Default for ChangeStream {
    fn default() -> Self {
        Self::new(256, OverflowPolicy::default())
    }
}

enum Receiver {
    Broadcast(broadcast::Receiver<Cdc>),
    Bounded(mpsc::Receiver<Cdc>),
}

/// Receiving end of one subscription
pub struct ChangeSubscription {
    id: u64,
    collection: String,
    receiver: Receiver,
}

impl ChangeSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Next change; `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<Cdc> {
        match &mut self.receiver {
            Receiver::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(cdc) => return Some(cdc),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "docudb::cdc",
                            collection = %self.collection,
                            subscriber = self.id,
                            skipped,
                            "subscriber lagged, oldest change events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Receiver::Bounded(rx) => rx.recv().await,
        }
    }

    /// Next change if one is buffered
    pub fn try_recv(&mut self) -> Option<Cdc> {
        match &mut self.receiver {
            Receiver::Broadcast(rx) => loop {
                match rx.try_recv() {
                    Ok(cdc) => return Some(cdc),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            },
            Receiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Handle of a task spawned by [`ChangeStream::on_change`]
pub struct ChangeStreamTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeStreamTask {
    /// Stops the task and waits for it to finish
    pub async fn cancel(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ChangeStreamTask {
    fn drop(&mut self) {
        // dropping the sender also resolves the stop signal
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::tx::{Action, Command};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn event(collection: &str, id: &str) -> Cdc {
        let doc = Document::from_value(json!({"_id": id})).unwrap();
        Cdc::new(
            &Command::new(collection, Action::Create, doc.clone()),
            id,
            None,
            Some(&doc),
        )
    }

    #[tokio::test]
    async fn test_publish_to_collection_subscribers() {
        let stream = ChangeStream::default();
        let mut users = stream.subscribe("user");
        let mut all = stream.subscribe(ALL_COLLECTIONS);
        let mut tasks = stream.subscribe("task");

        let result = stream.publish(&event("user", "u1"));
        assert_eq!(result.matched, 2);
        assert_eq!(result.delivered, 2);

        assert_eq!(users.recv().await.unwrap().document_id, "u1");
        assert_eq!(all.recv().await.unwrap().document_id, "u1");
        assert!(tasks.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let stream = ChangeStream::default();
        let sub = stream.subscribe("user");
        let _keep = stream.subscribe("user");
        drop(sub);

        let result = stream.publish(&event("user", "u1"));
        assert_eq!(result.pruned, 1);
        assert_eq!(stream.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_reject_newest_drops_when_full() {
        let stream = ChangeStream::new(2, OverflowPolicy::RejectNewest);
        let mut sub = stream.subscribe("user");
        for id in ["1", "2", "3"] {
            stream.publish(&event("user", id));
        }
        assert_eq!(sub.recv().await.unwrap().document_id, "1");
        assert_eq!(sub.recv().await.unwrap().document_id, "2");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_oldest_skips_lagged() {
        let stream = ChangeStream::new(2, OverflowPolicy::DropOldest);
        let mut sub = stream.subscribe("user");
        for id in ["1", "2", "3"] {
            let result = stream.publish(&event("user", id));
            assert_eq!(result.delivered, 1);
        }
        assert_eq!(sub.recv().await.unwrap().document_id, "2");
        assert_eq!(sub.recv().await.unwrap().document_id, "3");
    }

    #[tokio::test]
    async fn test_on_change_task() {
        let stream = ChangeStream::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let task = stream
            .on_change("user", move |collection: &str, cdc: &Cdc| {
                sink.lock().unwrap().push(format!("{}/{}", collection, cdc.document_id));
            })
            .unwrap();

        stream.publish(&event("user", "u1"));
        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["user/u1".to_string()]);

        task.cancel().await;
        stream.publish(&event("user", "u2"));
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn test_on_change_outside_runtime() {
        let stream = ChangeStream::default();
        assert!(stream.on_change("user", |_: &str, _: &Cdc| {}).is_err());
    }
}
