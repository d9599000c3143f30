//! Channel pool: the base lifecycle manager for outbound transport channels.
//!
//! The pool owns a bounded notification queue and a set of worker tasks,
//! each holding one channel built by the factory. The send path is
//! fire-and-forget: `queue_notification` never blocks and never waits for a
//! delivery confirmation; results come back asynchronously on the shared
//! event bus. Under queue pressure the pool opens additional channels, up
//! to `max_auto_scale_channels`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{ChannelFactory, Notification, PushChannel};
use crate::config::{ChannelSettings, ServiceSettings};
use crate::error::{PushError, Result};

/// Bounded wait for queued notifications to flush during disposal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the outward event bus
const EVENT_CAPACITY: usize = 1024;

/// Events surfaced to the owning application.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// An error occurred outside any caller's synchronous call path
    ServiceException { error: Arc<PushError> },
    /// The feedback channel reported a destination as no longer valid.
    /// The timestamp is always UTC, whatever offset the source reported in.
    SubscriptionExpired {
        device_token: String,
        expired_at: DateTime<Utc>,
        context: Option<String>,
    },
    NotificationSent { id: Uuid },
    NotificationFailed { id: Uuid, error: Arc<PushError> },
}

pub struct ChannelPool {
    factory: Arc<dyn ChannelFactory>,
    channel_settings: Arc<ChannelSettings>,
    service_settings: ServiceSettings,
    queue_tx: mpsc::Sender<Notification>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
    queue_depth: Arc<AtomicUsize>,
    worker_count: AtomicUsize,
    workers: std::sync::Mutex<JoinSet<()>>,
    token: CancellationToken,
    events: broadcast::Sender<ServiceEvent>,
    disposed: AtomicBool,
}

impl ChannelPool {
    /// Build the pool and open the initial channels.
    ///
    /// `token` is a child of the supervisor's cancellation authority; every
    /// worker observes it. Must be called within a tokio runtime.
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        channel_settings: Arc<ChannelSettings>,
        service_settings: ServiceSettings,
        events: broadcast::Sender<ServiceEvent>,
        token: CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(service_settings.queue_capacity.max(1));

        let pool = Self {
            factory,
            channel_settings,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            worker_count: AtomicUsize::new(0),
            workers: std::sync::Mutex::new(JoinSet::new()),
            token,
            events,
            service_settings,
            disposed: AtomicBool::new(false),
        };

        let ceiling = pool.service_settings.max_auto_scale_channels.max(1);
        let initial = pool.service_settings.channels.clamp(1, ceiling);
        for _ in 0..initial {
            pool.spawn_worker();
        }

        tracing::info!(
            channels = initial,
            max_channels = ceiling,
            queue_capacity = pool.service_settings.queue_capacity,
            "Channel pool started"
        );

        pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn service_settings(&self) -> &ServiceSettings {
        &self.service_settings
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Relaxed)
    }

    /// Queue a notification for delivery. Non-blocking: the caller never
    /// waits for a confirmation. On a full queue the pool scales up one
    /// channel if allowed and retries once, then reports `QueueFull`.
    pub fn queue_notification(&self, notification: Notification) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PushError::Disposed);
        }

        match self.queue_tx.try_send(notification) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(notification)) => {
                if !self.try_scale_up() {
                    return Err(PushError::QueueFull);
                }
                match self.queue_tx.try_send(notification) {
                    Ok(()) => {
                        self.queue_depth.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(_) => Err(PushError::QueueFull),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Disposed),
        }
    }

    /// Raise a service exception on the outward event bus.
    pub fn raise_service_exception(&self, error: impl Into<Arc<PushError>>) {
        let error = error.into();
        tracing::warn!(error = %error, "Service exception");
        let _ = self
            .events
            .send(ServiceEvent::ServiceException { error });
    }

    /// Raise a subscription-expired event. `expired_at` must already be UTC.
    pub fn raise_subscription_expired(
        &self,
        device_token: String,
        expired_at: DateTime<Utc>,
        context: Option<String>,
    ) {
        tracing::info!(
            device_token = %device_token,
            expired_at = %expired_at,
            "Subscription expired"
        );
        let _ = self.events.send(ServiceEvent::SubscriptionExpired {
            device_token,
            expired_at,
            context,
        });
    }

    /// Drain the queue (bounded), stop the workers, release the channels.
    /// Idempotent; the second and later calls are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            queued = self.queue_depth(),
            "Disposing channel pool"
        );

        let depth = self.queue_depth.clone();
        let drain = async {
            while depth.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(
                remaining = self.queue_depth(),
                "Queue drain timeout, undelivered notifications dropped"
            );
        }

        self.token.cancel();

        let mut workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        while workers.join_next().await.is_some() {}

        tracing::info!("Channel pool disposed");
    }

    fn try_scale_up(&self) -> bool {
        if !self.service_settings.auto_scale_channels {
            return false;
        }
        let ceiling = self.service_settings.max_auto_scale_channels.max(1);
        if self.worker_count.load(Ordering::Relaxed) >= ceiling {
            return false;
        }
        tracing::debug!(
            workers = self.worker_count.load(Ordering::Relaxed),
            ceiling = ceiling,
            "Scaling up channel pool under queue pressure"
        );
        self.spawn_worker();
        true
    }

    fn spawn_worker(&self) {
        let channel = match self.factory.create_channel(&self.channel_settings) {
            Ok(channel) => channel,
            Err(e) => {
                self.raise_service_exception(e);
                return;
            }
        };

        self.worker_count.fetch_add(1, Ordering::Relaxed);
        let worker = ChannelWorker {
            channel,
            queue_rx: self.queue_rx.clone(),
            queue_depth: self.queue_depth.clone(),
            token: self.token.child_token(),
            events: self.events.clone(),
        };

        let mut guard = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.spawn(worker.run());
    }
}

struct ChannelWorker {
    channel: Box<dyn PushChannel>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
    queue_depth: Arc<AtomicUsize>,
    token: CancellationToken,
    events: broadcast::Sender<ServiceEvent>,
}

impl ChannelWorker {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                next = async { self.queue_rx.lock().await.recv().await } => next,
            };
            let Some(notification) = next else {
                break;
            };
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);

            let id = notification.id;
            match self.channel.send(&notification).await {
                Ok(()) => {
                    let _ = self.events.send(ServiceEvent::NotificationSent { id });
                }
                Err(e) => {
                    tracing::warn!(notification_id = %id, error = %e, "Delivery failed");
                    let _ = self.events.send(ServiceEvent::NotificationFailed {
                        id,
                        error: Arc::new(e),
                    });
                }
            }
        }
        self.channel.close().await;
    }
}
