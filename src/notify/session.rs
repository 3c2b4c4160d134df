//! One long-lived streaming connection.
//!
//! `Connecting -> Open -> Closing -> Closed`. Whatever ends the session
//! (client gone, write failure, server shutdown, explicit close) goes
//! through [`StreamingSession::close`], which releases the heartbeat task,
//! the registry subscription and the transport exactly once.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::{NotificationRegistry, NotificationSink, Subscription};
use crate::limits::alert::SpendingNotification;

pub const CONNECTED_MESSAGE: &str = "Connected to Spending notifications";

const INBOX_CAPACITY: usize = 32;

/// What a session writes onto its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { message: String },
    Heartbeat { timestamp: i64 },
    Notification(SpendingNotification),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Notification(_) => "notification",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Connected { message } => json!({ "message": message }),
            Self::Heartbeat { timestamp } => json!({ "timestamp": timestamp }),
            Self::Notification(n) => serde_json::to_value(n).unwrap_or(Value::Null),
        }
    }
}

/// Anything a session can subscribe to.
pub trait NotificationSource: Send + Sync {
    fn subscribe(&self, user_id: i64, sink: Arc<dyn NotificationSink>) -> Subscription;
}

impl NotificationSource for NotificationRegistry {
    fn subscribe(&self, user_id: i64, sink: Arc<dyn NotificationSink>) -> Subscription {
        NotificationRegistry::subscribe(self, user_id, sink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct SessionInner {
    state: SessionState,
    heartbeat: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
    transport: Option<mpsc::Sender<SessionEvent>>,
}

pub struct StreamingSession {
    user_id: i64,
    heartbeat_every: Duration,
    inner: Mutex<SessionInner>,
}

impl StreamingSession {
    pub fn new(user_id: i64, heartbeat_every: Duration) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            heartbeat_every,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                heartbeat: None,
                subscription: None,
                transport: None,
            }),
        })
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drives the session until the client goes away, a write fails or
    /// `shutdown` fires. Always leaves the session `Closed`.
    pub async fn run(
        self: Arc<Self>,
        source: &dyn NotificationSource,
        transport: mpsc::Sender<SessionEvent>,
        shutdown: CancellationToken,
    ) {
        let connected = SessionEvent::Connected {
            message: CONNECTED_MESSAGE.to_string(),
        };
        if transport.send(connected).await.is_err() {
            self.close("client gone before connect");
            return;
        }

        let (inbox_tx, mut inbox) = mpsc::channel::<SpendingNotification>(INBOX_CAPACITY);
        let subscription = source.subscribe(self.user_id, Arc::new(inbox_tx));
        let write_failed = Arc::new(Notify::new());
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.user_id,
            transport.clone(),
            self.heartbeat_every,
            Arc::clone(&write_failed),
        ));

        {
            let mut inner = self.lock();
            if inner.state != SessionState::Connecting {
                // closed from outside while we were connecting
                drop(inner);
                heartbeat.abort();
                subscription.unsubscribe();
                return;
            }
            inner.heartbeat = Some(heartbeat);
            inner.subscription = Some(subscription);
            inner.transport = Some(transport.clone());
            inner.state = SessionState::Open;
        }
        info!("stream opened for user {}", self.user_id);

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break "server shutting down",
                _ = write_failed.notified() => break "heartbeat write failed",
                _ = transport.closed() => break "client disconnected",
                next = inbox.recv() => match next {
                    Some(notification) => {
                        if transport.send(SessionEvent::Notification(notification)).await.is_err() {
                            warn!("notification write failed for user {}", self.user_id);
                            break "notification write failed";
                        }
                    }
                    None => break "unsubscribed by registry",
                },
            }
        };

        drop(transport);
        self.close(reason);
    }

    /// Moves the session to `Closed`. Only the first call does anything and
    /// returns `true`.
    pub fn close(&self, reason: &str) -> bool {
        let (heartbeat, subscription, transport) = {
            let mut inner = self.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            inner.state = SessionState::Closing;
            (
                inner.heartbeat.take(),
                inner.subscription.take(),
                inner.transport.take(),
            )
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        drop(transport);

        self.lock().state = SessionState::Closed;
        info!("stream closed for user {}: {}", self.user_id, reason);
        true
    }
}

async fn heartbeat_loop(
    user_id: i64,
    transport: mpsc::Sender<SessionEvent>,
    every: Duration,
    write_failed: Arc<Notify>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let beat = SessionEvent::Heartbeat {
            timestamp: Utc::now().timestamp_millis(),
        };
        if transport.send(beat).await.is_err() {
            warn!("heartbeat failed for user {}", user_id);
            write_failed.notify_one();
            return;
        }
    }
}
