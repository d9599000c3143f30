//! Transport channels and their factory.
//!
//! A [`PushChannel`] is one live connection to the gateway. The pool holds
//! many of them, each created through a [`ChannelFactory`]. The service is
//! generic over factories so callers can substitute their own transport; the
//! default is [`ApnsChannelFactory`].

mod apns;

pub use apns::{encode_frame, ApnsChannel};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ChannelSettings;
use crate::error::{PushError, Result};

/// A single queued push notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    /// Hex-encoded device token identifying the destination
    pub device_token: String,
    pub payload: Value,
    /// When the gateway may discard the notification if undelivered
    pub expiration: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(device_token: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_token: device_token.into(),
            payload,
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// One outbound transport connection to the notification gateway.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;

    /// Release the underlying connection. Called once, at worker exit.
    async fn close(&self);
}

/// Builds transport channels from variant-typed settings.
pub trait ChannelFactory: Send + Sync {
    fn create_channel(&self, settings: &ChannelSettings) -> Result<Box<dyn PushChannel>>;
}

/// Default factory for the APNS transport. Rejects settings of any other
/// variant before constructing anything.
#[derive(Debug, Default)]
pub struct ApnsChannelFactory;

impl ChannelFactory for ApnsChannelFactory {
    fn create_channel(&self, settings: &ChannelSettings) -> Result<Box<dyn PushChannel>> {
        match settings {
            ChannelSettings::Apns(apns) => Ok(Box::new(ApnsChannel::new(apns.clone()))),
            other => Err(PushError::ChannelSettingsMismatch {
                expected: "apns",
                got: other.variant_name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApnsChannelSettings, FcmChannelSettings};
    use serde_json::json;

    #[test]
    fn test_factory_accepts_matching_variant() {
        let factory = ApnsChannelFactory;
        let settings = ChannelSettings::Apns(ApnsChannelSettings::default());
        assert!(factory.create_channel(&settings).is_ok());
    }

    #[test]
    fn test_factory_rejects_wrong_variant() {
        let factory = ApnsChannelFactory;
        let settings = ChannelSettings::Fcm(FcmChannelSettings {
            server_key: "key".into(),
            endpoint: "https://example.invalid".into(),
        });
        match factory.create_channel(&settings) {
            Ok(_) => panic!("factory built a channel from mismatched settings"),
            Err(err) => assert!(matches!(
                err,
                PushError::ChannelSettingsMismatch {
                    expected: "apns",
                    got: "fcm"
                }
            )),
        }
    }

    #[test]
    fn test_notification_builder() {
        let n = Notification::new("ab01", json!({"aps": {"alert": "hi"}}));
        assert_eq!(n.device_token, "ab01");
        assert!(n.expiration.is_none());

        let expiry = Utc::now();
        let n = n.with_expiration(expiry);
        assert_eq!(n.expiration, Some(expiry));
    }
}
