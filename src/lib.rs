// Infrastructure layer (shared components)
pub mod config;
pub mod error;

// Domain layer (delivery pipeline)
pub mod channel;
pub mod feedback;
pub mod pool;

// Application layer
pub mod service;

pub use channel::{ApnsChannelFactory, ChannelFactory, Notification, PushChannel};
pub use config::{ApnsChannelSettings, ChannelSettings, ServiceSettings, Settings};
pub use error::{PushError, Result};
pub use feedback::{ExpiredSubscription, FeedbackChannel, FeedbackPoller};
pub use pool::{ChannelPool, ServiceEvent};
pub use service::{
    default_run_feedback_prior_to_dispose, set_default_run_feedback_prior_to_dispose,
    ApnsPushService,
};
