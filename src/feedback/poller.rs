use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::ApnsChannelSettings;
use crate::error::PushError;

use super::{ExpiredSubscription, FeedbackChannel};

/// Capacity of the poller's event channel. A lagging bridge drops the
/// oldest events (broadcast semantics).
const EVENT_CAPACITY: usize = 256;

/// Events raised during a feedback cycle.
#[derive(Debug, Clone)]
pub enum FeedbackEvent {
    /// One expired-destination record, timestamp still in the source offset
    Received {
        device_token: String,
        timestamp: DateTime<FixedOffset>,
    },
    /// The cycle failed; exactly one of these per failing cycle
    Failed { error: Arc<PushError> },
}

/// Runs individual feedback cycles and reports through events.
///
/// A cycle holds no state between runs. Errors never propagate to the
/// invoker: anything that goes wrong inside a cycle becomes a single
/// [`FeedbackEvent::Failed`], so invoking this from a timer callback can
/// never crash the process. This boundary is deliberate and load-bearing.
pub struct FeedbackPoller {
    channel: Arc<dyn FeedbackChannel>,
    events: broadcast::Sender<FeedbackEvent>,
}

impl FeedbackPoller {
    pub fn new(channel: Arc<dyn FeedbackChannel>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { channel, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedbackEvent> {
        self.events.subscribe()
    }

    /// Run one feedback cycle. Raises one `Received` event per record
    /// before returning; never returns an error.
    pub async fn run(&self, settings: &ApnsChannelSettings, token: &CancellationToken) {
        match self.channel.fetch(settings, token).await {
            Ok(records) => {
                tracing::debug!(records = records.len(), "Feedback cycle completed");
                for ExpiredSubscription {
                    device_token,
                    timestamp,
                } in records
                {
                    let _ = self.events.send(FeedbackEvent::Received {
                        device_token,
                        timestamp,
                    });
                }
            }
            Err(e) if e.is_cancelled() => {
                // Normal during shutdown, not a service fault
                tracing::debug!("Feedback cycle aborted by cancellation");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Feedback cycle failed");
                let _ = self.events.send(FeedbackEvent::Failed {
                    error: Arc::new(e),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};

    struct FakeChannel {
        records: Vec<ExpiredSubscription>,
    }

    #[async_trait]
    impl FeedbackChannel for FakeChannel {
        async fn fetch(
            &self,
            _settings: &ApnsChannelSettings,
            _token: &CancellationToken,
        ) -> Result<Vec<ExpiredSubscription>> {
            Ok(self.records.clone())
        }
    }

    struct FailingChannel;

    #[async_trait]
    impl FeedbackChannel for FailingChannel {
        async fn fetch(
            &self,
            _settings: &ApnsChannelSettings,
            _token: &CancellationToken,
        ) -> Result<Vec<ExpiredSubscription>> {
            Err(PushError::Feedback("connection refused".into()))
        }
    }

    struct CancelledChannel;

    #[async_trait]
    impl FeedbackChannel for CancelledChannel {
        async fn fetch(
            &self,
            _settings: &ApnsChannelSettings,
            _token: &CancellationToken,
        ) -> Result<Vec<ExpiredSubscription>> {
            Err(PushError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_run_emits_one_event_per_record() {
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let records = vec![
            ExpiredSubscription {
                device_token: "aa".into(),
                timestamp: offset.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            },
            ExpiredSubscription {
                device_token: "bb".into(),
                timestamp: offset.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap(),
            },
        ];
        let poller = FeedbackPoller::new(Arc::new(FakeChannel {
            records: records.clone(),
        }));
        let mut rx = poller.subscribe();

        poller
            .run(&ApnsChannelSettings::default(), &CancellationToken::new())
            .await;

        for expected in &records {
            match rx.recv().await.unwrap() {
                FeedbackEvent::Received {
                    device_token,
                    timestamp,
                } => {
                    assert_eq!(&device_token, &expected.device_token);
                    assert_eq!(timestamp, expected.timestamp);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_cycle_emits_exactly_one_failure_event() {
        let poller = FeedbackPoller::new(Arc::new(FailingChannel));
        let mut rx = poller.subscribe();

        // Does not panic and does not return an error
        poller
            .run(&ApnsChannelSettings::default(), &CancellationToken::new())
            .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            FeedbackEvent::Failed { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_cycle_emits_no_events() {
        let poller = FeedbackPoller::new(Arc::new(CancelledChannel));
        let mut rx = poller.subscribe();

        poller
            .run(&ApnsChannelSettings::default(), &CancellationToken::new())
            .await;

        assert!(rx.try_recv().is_err());
    }
}
