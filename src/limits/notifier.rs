use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::limits::alert::{AlertEvaluator, SpendingNotification, SpendingStatus};
use crate::limits::ledger::LimitLedger;
use crate::notify::{
    DeliveryError, NotificationRegistry, NotificationSink, NotificationSource, PublishReport,
    Subscription,
};

pub const NO_ACTIVE_LIMIT: &str = "No active spending limit found";

/// Glue between the ledger, the alert evaluator and the live subscribers.
#[derive(Clone)]
pub struct SpendingNotifier {
    ledger: LimitLedger,
    evaluator: AlertEvaluator,
    registry: NotificationRegistry,
}

impl SpendingNotifier {
    pub fn new(ledger: LimitLedger, evaluator: AlertEvaluator, registry: NotificationRegistry) -> Self {
        Self {
            ledger,
            evaluator,
            registry,
        }
    }

    pub fn registry(&self) -> &NotificationRegistry {
        &self.registry
    }

    pub async fn status(&self, user_id: i64) -> AppResult<SpendingStatus> {
        let limit = self
            .ledger
            .active_limit(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(NO_ACTIVE_LIMIT.into()))?;
        SpendingStatus::from_limit(&limit)
    }

    /// Current state as a notification, or `None` for users without a budget.
    pub async fn build_notification(&self, user_id: i64) -> AppResult<Option<SpendingNotification>> {
        match self.ledger.active_limit(user_id).await? {
            Some(limit) => Ok(Some(self.evaluator.notification(user_id, &limit).await?)),
            None => Ok(None),
        }
    }

    /// Pushes the current state to every subscriber of the user. Never fails
    /// the caller: the mutation that triggered it is already committed.
    pub async fn notify_user(&self, user_id: i64) -> PublishReport {
        if self.registry.subscriber_count(user_id) == 0 {
            return PublishReport::default();
        }
        match self.build_notification(user_id).await {
            Ok(Some(notification)) => self.registry.publish(user_id, &notification).await,
            Ok(None) => {
                debug!("user {} has no active limit; nothing to publish", user_id);
                PublishReport::default()
            }
            Err(err) => {
                warn!("could not build notification for user {}: {}", user_id, err);
                PublishReport::default()
            }
        }
    }
}

/// Wraps a new subscriber's sink so its initial status can't overtake a
/// newer publish: deliveries are serialized, and once a publish got through
/// the initial snapshot is dropped.
struct OrderedSink {
    inner: Arc<dyn NotificationSink>,
    published: Mutex<bool>,
}

impl OrderedSink {
    /// `Ok(false)` when a publish already reached the sink.
    async fn deliver_initial(&self, event: &SpendingNotification) -> Result<bool, DeliveryError> {
        let published = self.published.lock().await;
        if *published {
            return Ok(false);
        }
        self.inner.deliver(event).await?;
        Ok(true)
    }
}

#[async_trait]
impl NotificationSink for OrderedSink {
    async fn deliver(&self, event: &SpendingNotification) -> Result<(), DeliveryError> {
        let mut published = self.published.lock().await;
        self.inner.deliver(event).await?;
        *published = true;
        Ok(())
    }
}

impl NotificationSource for SpendingNotifier {
    /// Registers the sink, then sends it (and only it) the current state.
    fn subscribe(&self, user_id: i64, sink: Arc<dyn NotificationSink>) -> Subscription {
        let sink = Arc::new(OrderedSink {
            inner: sink,
            published: Mutex::new(false),
        });
        let subscription = self.registry.subscribe(user_id, sink.clone());
        let notifier = self.clone();
        tokio::spawn(async move {
            match notifier.build_notification(user_id).await {
                Ok(Some(notification)) => match sink.deliver_initial(&notification).await {
                    Ok(true) => {}
                    Ok(false) => debug!("initial status for user {} superseded by a publish", user_id),
                    Err(err) => debug!("initial status for user {} not delivered: {}", user_id, err),
                },
                Ok(None) => {}
                Err(err) => warn!("initial status for user {} failed: {}", user_id, err),
            }
        });
        subscription
    }
}
