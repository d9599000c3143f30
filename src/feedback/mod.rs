//! Feedback-channel reconciliation.
//!
//! The gateway's feedback endpoint reports device tokens that are no longer
//! valid (typically uninstalled apps). [`FeedbackPoller`] runs one stateless
//! cycle at a time, either from the supervisor's recurring timer or on
//! demand, and reports everything through events; a cycle never returns an
//! error to its invoker.

mod apns;
mod poller;

pub use apns::{parse_feedback, ApnsFeedbackChannel};
pub use poller::{FeedbackEvent, FeedbackPoller};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tokio_util::sync::CancellationToken;

use crate::config::ApnsChannelSettings;
use crate::error::Result;

/// One expired-destination record from the feedback endpoint.
///
/// The timestamp is kept in the source's own offset here; the supervisor
/// normalizes it to UTC before it crosses the outward event surface, so
/// callers can compare timestamps across records from different sources.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredSubscription {
    pub device_token: String,
    pub timestamp: DateTime<FixedOffset>,
}

/// Capability for fetching one batch of expired-destination records.
///
/// Implementations must observe the cancellation token between reads; a
/// cancelled fetch returns `PushError::Cancelled` rather than partial data.
#[async_trait]
pub trait FeedbackChannel: Send + Sync {
    async fn fetch(
        &self,
        settings: &ApnsChannelSettings,
        token: &CancellationToken,
    ) -> Result<Vec<ExpiredSubscription>>;
}
