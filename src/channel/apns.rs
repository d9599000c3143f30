//! Concrete APNS transport over the legacy binary gateway interface.
//!
//! Connection establishment is lazy: the first `send` dials the gateway.
//! TLS termination is out of scope for this crate; production deployments
//! front the connection with their own TLS layer. The [`PushChannel`] trait
//! is the seam where a TLS-capable transport plugs in.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::ApnsChannelSettings;
use crate::error::{PushError, Result};

use super::{Notification, PushChannel};

/// Simple-format command byte (identifier + expiry + token + payload)
const COMMAND_SEND: u8 = 1;

/// Gateway-documented payload ceiling for the legacy interface
const MAX_PAYLOAD_BYTES: usize = 2048;

/// Device tokens on the binary gateway are a fixed 32 bytes
const DEVICE_TOKEN_BYTES: usize = 32;

pub struct ApnsChannel {
    settings: ApnsChannelSettings,
    stream: Mutex<Option<TcpStream>>,
}

impl ApnsChannel {
    pub fn new(settings: ApnsChannelSettings) -> Self {
        Self {
            settings,
            stream: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.settings.gateway_addr();
        tracing::debug!(addr = %addr, "Connecting push channel to gateway");
        let stream = TcpStream::connect(&addr).await?;
        Ok(stream)
    }
}

#[async_trait]
impl PushChannel for ApnsChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let frame = encode_frame(notification)?;

        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        if let Err(e) = stream.write_all(&frame).await {
            // Broken connection is dropped; the next send redials
            return Err(e.into());
        }
        *guard = Some(stream);

        tracing::debug!(
            notification_id = %notification.id,
            bytes = frame.len(),
            "Notification written to gateway"
        );
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Encode one notification into a legacy simple-format gateway frame.
pub fn encode_frame(notification: &Notification) -> Result<Vec<u8>> {
    let token = decode_device_token(&notification.device_token)?;
    let payload = serde_json::to_vec(&notification.payload)?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(PushError::PayloadTooLarge(payload.len()));
    }

    // Frame identifier is the low 32 bits of the notification id, enough
    // for the gateway's error-response correlation.
    let identifier = notification.id.as_u128() as u32;
    let expiry = notification
        .expiration
        .map(|t| t.timestamp().max(0) as u32)
        .unwrap_or(0);

    let mut frame = Vec::with_capacity(11 + token.len() + payload.len());
    frame.push(COMMAND_SEND);
    frame.extend_from_slice(&identifier.to_be_bytes());
    frame.extend_from_slice(&expiry.to_be_bytes());
    frame.extend_from_slice(&(token.len() as u16).to_be_bytes());
    frame.extend_from_slice(&token);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_device_token(token: &str) -> Result<Vec<u8>> {
    let cleaned: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    // Gateway tokens are exactly 32 bytes; anything else would produce a
    // corrupt frame
    if cleaned.len() != DEVICE_TOKEN_BYTES * 2 {
        return Err(PushError::InvalidDeviceToken(token.to_string()));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|_| PushError::InvalidDeviceToken(token.to_string()))
        })
        .collect()
}
