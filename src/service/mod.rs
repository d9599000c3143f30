//! The APNS push-delivery supervisor.
//!
//! Owns the channel pool, the feedback poller, the cancellation authority,
//! and the recurring feedback timer. Lifecycle: Constructing → Running →
//! Disposing → Disposed, with no way back. The send path is fire-and-forget;
//! all asynchronous outcomes arrive on the [`ServiceEvent`] bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::channel::{ApnsChannelFactory, ChannelFactory, Notification};
use crate::config::{ApnsChannelSettings, ChannelSettings, ServiceSettings};
use crate::error::Result;
use crate::feedback::{ApnsFeedbackChannel, FeedbackChannel, FeedbackEvent, FeedbackPoller};
use crate::pool::{ChannelPool, ServiceEvent};

/// Fixed warm-up before the first automatic feedback cycle
const FEEDBACK_WARMUP: Duration = Duration::from_secs(10);

/// Connection ceiling documented by the gateway operator. Applied to the
/// service settings at construction regardless of the caller-supplied value;
/// not configurable.
const MAX_GATEWAY_CHANNELS: usize = 20;

/// Capacity of the outward event bus
const EVENT_CAPACITY: usize = 1024;

/// Process-wide default for [`ApnsPushService::set_run_feedback_prior_to_dispose`].
/// Read once per instance at construction; writes affect only instances
/// constructed afterwards.
static DEFAULT_RUN_FEEDBACK_PRIOR_TO_DISPOSE: AtomicBool = AtomicBool::new(false);

pub fn set_default_run_feedback_prior_to_dispose(value: bool) {
    DEFAULT_RUN_FEEDBACK_PRIOR_TO_DISPOSE.store(value, Ordering::SeqCst);
}

pub fn default_run_feedback_prior_to_dispose() -> bool {
    DEFAULT_RUN_FEEDBACK_PRIOR_TO_DISPOSE.load(Ordering::SeqCst)
}

pub struct ApnsPushService {
    pool: Arc<ChannelPool>,
    poller: Option<Arc<FeedbackPoller>>,
    channel_settings: ApnsChannelSettings,
    events: broadcast::Sender<ServiceEvent>,
    cancel: CancellationToken,
    /// Child of `cancel` scoped to feedback work (timer, bridge, cycles).
    /// Cancelled at the start of disposal so no new cycle can begin while
    /// the pool is still draining.
    feedback_cancel: CancellationToken,
    run_feedback_prior_to_dispose: AtomicBool,
    disposed: AtomicBool,
}

impl ApnsPushService {
    /// This service never blocks a caller waiting for a delivery
    /// confirmation; results arrive asynchronously as events. Fixed trait
    /// of the APNS variant, not configurable per instance.
    pub const BLOCKS_ON_MESSAGE_RESULT: bool = false;

    pub fn new(channel_settings: ApnsChannelSettings) -> Self {
        Self::with_parts(None, channel_settings, None)
    }

    pub fn with_settings(
        channel_settings: ApnsChannelSettings,
        service_settings: ServiceSettings,
    ) -> Self {
        Self::with_parts(None, channel_settings, Some(service_settings))
    }

    pub fn with_factory(
        factory: Arc<dyn ChannelFactory>,
        channel_settings: ApnsChannelSettings,
    ) -> Self {
        Self::with_parts(Some(factory), channel_settings, None)
    }

    /// Canonical constructor every other constructor resolves to.
    ///
    /// Performs no network I/O. Must be called within a tokio runtime: the
    /// event bridge and, when `feedback_interval_minutes > 0`, the recurring
    /// feedback timer are spawned here.
    pub fn with_parts(
        factory: Option<Arc<dyn ChannelFactory>>,
        channel_settings: ApnsChannelSettings,
        service_settings: Option<ServiceSettings>,
    ) -> Self {
        Self::with_feedback_channel(
            factory,
            channel_settings,
            service_settings,
            Arc::new(ApnsFeedbackChannel),
        )
    }

    /// Like [`Self::with_parts`], with the feedback capability substituted.
    /// The seam for non-default feedback transports.
    pub fn with_feedback_channel(
        factory: Option<Arc<dyn ChannelFactory>>,
        channel_settings: ApnsChannelSettings,
        service_settings: Option<ServiceSettings>,
        feedback_channel: Arc<dyn FeedbackChannel>,
    ) -> Self {
        let factory = factory.unwrap_or_else(|| Arc::new(ApnsChannelFactory));
        let mut service_settings = service_settings.unwrap_or_default();
        // Gateway operator ceiling; overrides any caller-supplied value
        service_settings.max_auto_scale_channels = MAX_GATEWAY_CHANNELS;

        let cancel = CancellationToken::new();
        let feedback_cancel = cancel.child_token();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let pool = Arc::new(ChannelPool::new(
            factory,
            Arc::new(ChannelSettings::Apns(channel_settings.clone())),
            service_settings,
            events.clone(),
            cancel.child_token(),
        ));

        let service = Self {
            pool,
            poller: None,
            channel_settings,
            events,
            cancel,
            feedback_cancel,
            run_feedback_prior_to_dispose: AtomicBool::new(
                default_run_feedback_prior_to_dispose(),
            ),
            disposed: AtomicBool::new(false),
        };

        // Interval zero is an explicit opt-out of feedback polling
        if service.channel_settings.feedback_interval_minutes > 0 {
            service.start_feedback(feedback_channel)
        } else {
            tracing::info!("Feedback polling disabled (interval is zero)");
            service
        }
    }

    /// Wire the poller into the outward event surface and start the timer.
    fn start_feedback(mut self, channel: Arc<dyn FeedbackChannel>) -> Self {
        let poller = Arc::new(FeedbackPoller::new(channel));

        // Explicit event bridge: poller events are re-raised as service
        // events, with the record timestamp coerced to UTC on the way out.
        let mut feedback_rx = poller.subscribe();
        let bridge_pool = self.pool.clone();
        let bridge_cancel = self.feedback_cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = bridge_cancel.cancelled() => {
                        // The pre-dispose flush may have buffered events;
                        // forward them before stopping or the owner never
                        // sees what the flush produced
                        loop {
                            match feedback_rx.try_recv() {
                                Ok(event) => forward_feedback_event(&bridge_pool, event),
                                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                                    tracing::warn!(
                                        skipped = skipped,
                                        "Feedback event bridge lagged"
                                    );
                                }
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                    event = feedback_rx.recv() => event,
                };
                match event {
                    Ok(event) => forward_feedback_event(&bridge_pool, event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Feedback event bridge lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Warm-up is measured from construction, not from the first poll
        // of the spawned task
        let start = tokio::time::Instant::now() + FEEDBACK_WARMUP;
        let interval = Duration::from_secs(self.channel_settings.feedback_interval_minutes * 60);
        let timer_poller = poller.clone();
        let timer_settings = self.channel_settings.clone();
        let timer_cancel = self.feedback_cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(start, interval);
            tracing::info!(
                warmup_secs = FEEDBACK_WARMUP.as_secs(),
                interval_minutes = timer_settings.feedback_interval_minutes,
                "Feedback timer started"
            );
            loop {
                tokio::select! {
                    _ = timer_cancel.cancelled() => break,
                    _ = timer.tick() => {
                        timer_poller.run(&timer_settings, &timer_cancel).await;
                    }
                }
            }
            tracing::debug!("Feedback timer stopped");
        });

        self.poller = Some(poller);
        self
    }

    /// Subscribe to the outward event surface. A caller that never
    /// subscribes silently loses background-failure information.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn service_settings(&self) -> &ServiceSettings {
        self.pool.service_settings()
    }

    /// Whether `dispose` runs one final feedback cycle before releasing the
    /// pool. Initialized from the process-wide default at construction.
    pub fn run_feedback_prior_to_dispose(&self) -> bool {
        self.run_feedback_prior_to_dispose.load(Ordering::SeqCst)
    }

    pub fn set_run_feedback_prior_to_dispose(&self, value: bool) {
        self.run_feedback_prior_to_dispose
            .store(value, Ordering::SeqCst);
    }

    /// Queue a notification for fire-and-forget delivery.
    pub fn queue_notification(&self, notification: Notification) -> Result<()> {
        self.pool.queue_notification(notification)
    }

    /// Trigger one feedback cycle on demand, bypassing the timer.
    ///
    /// Never returns an error: cycle failures are routed to the
    /// `ServiceException` event, and with feedback polling disabled
    /// (interval zero) this is a defined no-op. May run concurrently with a
    /// timer-triggered cycle; no mutual exclusion is imposed.
    pub async fn run_feedback_service(&self) {
        match &self.poller {
            Some(poller) => {
                poller.run(&self.channel_settings, &self.feedback_cancel).await;
            }
            None => {
                tracing::debug!("run_feedback_service called with feedback polling disabled");
            }
        }
    }

    /// Dispose the service. Runs the optional final feedback cycle first,
    /// since the flush needs the transport resources still live; then stops
    /// feedback work, drains the pool, and releases the authority.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.run_feedback_prior_to_dispose() {
            // Failures surface as events and must not stop disposal
            self.run_feedback_service().await;
        }

        // No new feedback cycle may start once disposal is underway; the
        // pool's own child token stays live for the drain below
        self.feedback_cancel.cancel();

        self.pool.dispose().await;
        self.cancel.cancel();

        tracing::info!("Push service disposed");
    }
}

/// Re-raise one poller event on the outward surface, coercing the record
/// timestamp to UTC.
fn forward_feedback_event(pool: &ChannelPool, event: FeedbackEvent) {
    match event {
        FeedbackEvent::Received {
            device_token,
            timestamp,
        } => {
            pool.raise_subscription_expired(device_token, timestamp.with_timezone(&Utc), None);
        }
        FeedbackEvent::Failed { error } => {
            pool.raise_service_exception(error);
        }
    }
}

impl Drop for ApnsPushService {
    fn drop(&mut self) {
        // Stops the timer and any in-flight cycle even when the owner
        // never called dispose
        self.cancel.cancel();
    }
}
