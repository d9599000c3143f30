//! Concrete feedback transport for the APNS feedback endpoint.
//!
//! The endpoint streams fixed-layout tuples until it closes the connection:
//! a big-endian `u32` of seconds since the epoch, a big-endian `u16` token
//! length, then that many token bytes. TLS is out of scope here, as on the
//! delivery side.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ApnsChannelSettings;
use crate::error::{PushError, Result};

use super::{ExpiredSubscription, FeedbackChannel};

/// Bytes preceding the token in each tuple: u32 seconds + u16 length
const TUPLE_HEADER_BYTES: usize = 6;

#[derive(Debug, Default)]
pub struct ApnsFeedbackChannel;

#[async_trait]
impl FeedbackChannel for ApnsFeedbackChannel {
    async fn fetch(
        &self,
        settings: &ApnsChannelSettings,
        token: &CancellationToken,
    ) -> Result<Vec<ExpiredSubscription>> {
        let addr = settings.feedback_addr();
        tracing::debug!(addr = %addr, "Connecting to feedback endpoint");

        let mut stream = tokio::select! {
            _ = token.cancelled() => return Err(PushError::Cancelled),
            connected = TcpStream::connect(&addr) => connected?,
        };

        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 4096];
            let read = tokio::select! {
                _ = token.cancelled() => return Err(PushError::Cancelled),
                read = stream.read(&mut chunk) => read?,
            };
            if read == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..read]);
        }

        parse_feedback(&buf)
    }
}

/// Parse a complete feedback response body into expired-subscription records.
///
/// Wire timestamps are epoch seconds, so records leave here with a zero
/// offset; the UTC normalization at the event surface is what guarantees the
/// contract for sources that report in local offsets.
pub fn parse_feedback(buf: &[u8]) -> Result<Vec<ExpiredSubscription>> {
    let mut records = Vec::new();
    let mut cursor = 0usize;

    while cursor < buf.len() {
        if buf.len() - cursor < TUPLE_HEADER_BYTES {
            return Err(PushError::Feedback(format!(
                "truncated tuple header at offset {cursor}"
            )));
        }
        let secs = u32::from_be_bytes([
            buf[cursor],
            buf[cursor + 1],
            buf[cursor + 2],
            buf[cursor + 3],
        ]);
        let token_len = u16::from_be_bytes([buf[cursor + 4], buf[cursor + 5]]) as usize;
        cursor += TUPLE_HEADER_BYTES;

        if buf.len() - cursor < token_len {
            return Err(PushError::Feedback(format!(
                "truncated token of {token_len} bytes at offset {cursor}"
            )));
        }
        let device_token = hex_encode(&buf[cursor..cursor + token_len]);
        cursor += token_len;

        let timestamp = match Utc.timestamp_opt(secs as i64, 0).single() {
            Some(t) => t.fixed_offset(),
            None => {
                return Err(PushError::Feedback(format!(
                    "timestamp {secs} out of range"
                )))
            }
        };

        records.push(ExpiredSubscription {
            device_token,
            timestamp,
        });
    }

    Ok(records)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
