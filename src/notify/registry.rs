//! In-process fan-out of spending notifications to live subscribers.
//!
//! The registry maps a user id to the set of sinks currently listening for
//! that user. A publish takes a point-in-time snapshot of the set under the
//! lock, delivers to every sink concurrently with the lock released, and then
//! removes the sinks whose delivery failed.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::limits::alert::SpendingNotification;

pub type SubscriberId = u64;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber is closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Receiving end of a subscription, typically a streaming session.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &SpendingNotification) -> Result<(), DeliveryError>;
}

#[async_trait]
impl NotificationSink for mpsc::Sender<SpendingNotification> {
    async fn deliver(&self, event: &SpendingNotification) -> Result<(), DeliveryError> {
        self.send(event.clone()).await.map_err(|_| DeliveryError::Closed)
    }
}

type SinkMap = HashMap<i64, HashMap<SubscriberId, Arc<dyn NotificationSink>>>;

struct RegistryInner {
    clients: Mutex<SinkMap>,
    next_id: AtomicU64,
    delivery_timeout: Duration,
}

impl RegistryInner {
    fn clients(&self) -> MutexGuard<'_, SinkMap> {
        // a panic while holding the lock cannot leave the map half-written
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, user_id: i64, id: SubscriberId) -> bool {
        let mut clients = self.clients();
        let Some(set) = clients.get_mut(&user_id) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            clients.remove(&user_id);
            info!("all subscribers removed for user {}", user_id);
        } else if removed {
            info!("subscriber removed for user {}. Remaining: {}", user_id, set.len());
        }
        removed
    }
}

/// Summary of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct NotificationRegistry {
    inner: Arc<RegistryInner>,
}

impl NotificationRegistry {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                delivery_timeout,
            }),
        }
    }

    /// Registers `sink` for `user_id`. Dropping or calling
    /// [`Subscription::unsubscribe`] on the returned handle removes exactly
    /// this sink.
    pub fn subscribe(&self, user_id: i64, sink: Arc<dyn NotificationSink>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut clients = self.inner.clients();
            let set = clients.entry(user_id).or_default();
            set.insert(id, sink);
            set.len()
        };
        info!("subscriber added for user {}. Total subscribers: {}", user_id, total);

        Subscription {
            registry: Arc::downgrade(&self.inner),
            user_id,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Idempotent; returns whether something was removed.
    pub fn unsubscribe(&self, user_id: i64, id: SubscriberId) -> bool {
        self.inner.remove(user_id, id)
    }

    /// Delivers `event` to every sink registered for `user_id`. Failures are
    /// isolated per sink and never returned; failed sinks are dropped once
    /// the whole broadcast has finished.
    pub async fn publish(&self, user_id: i64, event: &SpendingNotification) -> PublishReport {
        let snapshot: Vec<(SubscriberId, Arc<dyn NotificationSink>)> = {
            let clients = self.inner.clients();
            match clients.get(&user_id) {
                Some(set) => set.iter().map(|(id, sink)| (*id, Arc::clone(sink))).collect(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            debug!("no subscribers for user {}", user_id);
            return PublishReport::default();
        }

        let timeout = self.inner.delivery_timeout;
        let deliveries = snapshot.into_iter().map(|(id, sink)| async move {
            let attempt = AssertUnwindSafe(sink.deliver(event)).catch_unwind();
            let failure = match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(err))) => Some(err.to_string()),
                Ok(Err(_)) => Some("subscriber panicked".to_string()),
                Err(_) => Some(format!("no delivery within {timeout:?}")),
            };
            (id, failure)
        });
        let outcomes = join_all(deliveries).await;

        let mut report = PublishReport::default();
        for (id, failure) in outcomes {
            match failure {
                None => report.delivered += 1,
                Some(reason) => {
                    warn!("delivery to subscriber {} of user {} failed: {}", id, user_id, reason);
                    report.failed += 1;
                    self.inner.remove(user_id, id);
                }
            }
        }
        report
    }

    pub fn subscriber_count(&self, user_id: i64) -> usize {
        self.inner.clients().get(&user_id).map_or(0, HashMap::len)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.clients().values().map(HashMap::len).sum()
    }

    pub fn user_ids(&self) -> Vec<i64> {
        self.inner.clients().keys().copied().collect()
    }

    /// Drops every registration without telling the subscribers.
    pub fn shutdown(&self) {
        let users = {
            let mut clients = self.inner.clients();
            let users = clients.len();
            clients.clear();
            users
        };
        info!("cleared all subscribers for {} users", users);
    }
}

/// Handle returned by [`NotificationRegistry::subscribe`].
pub struct Subscription {
    registry: Weak<RegistryInner>,
    user_id: i64,
    id: SubscriberId,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Removes the sink. Only the first call has an effect.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(self.user_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
