use thiserror::Error;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Channel settings mismatch: expected {expected}, got {got}")]
    ChannelSettingsMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Invalid device token: {0}")]
    InvalidDeviceToken(String),

    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Payload of {0} bytes exceeds the gateway limit")]
    PayloadTooLarge(usize),

    #[error("Feedback cycle failed: {0}")]
    Feedback(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notification queue is full")]
    QueueFull,

    #[error("Service has been disposed")]
    Disposed,

    #[error("Operation cancelled")]
    Cancelled,
}

impl PushError {
    /// Whether this error is a cancellation observed during shutdown,
    /// which is reported at debug level rather than as a service exception.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PushError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PushError>;
