use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

/// Variant-typed channel configuration.
///
/// A factory only accepts the variant it builds channels for; passing another
/// variant is a hard error (`PushError::ChannelSettingsMismatch`).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ChannelSettings {
    Apns(ApnsChannelSettings),
    Fcm(FcmChannelSettings),
}

impl ChannelSettings {
    pub fn variant_name(&self) -> &'static str {
        match self {
            ChannelSettings::Apns(_) => "apns",
            ChannelSettings::Fcm(_) => "fcm",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApnsChannelSettings {
    /// Gateway endpoint notifications are delivered to
    #[serde(default = "default_gateway_host")]
    pub gateway_host: String,
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,
    /// Feedback endpoint reporting expired device tokens
    #[serde(default = "default_feedback_host")]
    pub feedback_host: String,
    #[serde(default = "default_feedback_port")]
    pub feedback_port: u16,
    /// Minutes between automatic feedback cycles. Zero disables the
    /// recurring feedback timer entirely.
    #[serde(default = "default_feedback_interval_minutes")]
    pub feedback_interval_minutes: u64,
}

fn default_gateway_host() -> String {
    "gateway.push.apple.com".to_string()
}

fn default_gateway_port() -> u16 {
    2195
}

fn default_feedback_host() -> String {
    "feedback.push.apple.com".to_string()
}

fn default_feedback_port() -> u16 {
    2196
}

fn default_feedback_interval_minutes() -> u64 {
    10 // matches the gateway operator's suggested polling cadence
}

impl Default for ApnsChannelSettings {
    fn default() -> Self {
        Self {
            gateway_host: default_gateway_host(),
            gateway_port: default_gateway_port(),
            feedback_host: default_feedback_host(),
            feedback_port: default_feedback_port(),
            feedback_interval_minutes: default_feedback_interval_minutes(),
        }
    }
}

impl ApnsChannelSettings {
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway_host, self.gateway_port)
    }

    pub fn feedback_addr(&self) -> String {
        format!("{}:{}", self.feedback_host, self.feedback_port)
    }
}

/// Settings for an FCM transport. Only the shape matters to this crate: it
/// exists so a factory handed the wrong variant can fail fast.
#[derive(Debug, Clone, Deserialize)]
pub struct FcmChannelSettings {
    pub server_key: String,
    #[serde(default = "default_fcm_endpoint")]
    pub endpoint: String,
}

fn default_fcm_endpoint() -> String {
    "https://fcm.googleapis.com/fcm/send".to_string()
}

/// Pool-wide delivery settings shared by all channels.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    /// Number of channels (workers) opened at startup
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Whether the pool may open additional channels under queue pressure
    #[serde(default = "default_auto_scale_channels")]
    pub auto_scale_channels: bool,
    /// Upper bound on channels when auto-scaling. The APNS supervisor
    /// forces this to 20 at construction regardless of the value supplied
    /// here; the gateway operator documents 20 connections as the ceiling.
    #[serde(default = "default_max_auto_scale_channels")]
    pub max_auto_scale_channels: usize,
    /// Capacity of the bounded notification queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_channels() -> usize {
    1
}

fn default_auto_scale_channels() -> bool {
    true
}

fn default_max_auto_scale_channels() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            auto_scale_channels: default_auto_scale_channels(),
            max_auto_scale_channels: default_max_auto_scale_channels(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Top-level settings loadable from config files and the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub channel: ChannelSettings,
    #[serde(default)]
    pub service: ServiceSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("channel.transport", "apns")?
            .set_default("channel.gateway_host", default_gateway_host())?
            .set_default("channel.gateway_port", default_gateway_port() as i64)?
            .set_default("channel.feedback_host", default_feedback_host())?
            .set_default("channel.feedback_port", default_feedback_port() as i64)?
            .set_default(
                "channel.feedback_interval_minutes",
                default_feedback_interval_minutes() as i64,
            )?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // CHANNEL_GATEWAY_HOST, SERVICE_QUEUE_CAPACITY, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
