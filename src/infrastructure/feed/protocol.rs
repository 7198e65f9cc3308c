//! Wire protocol for the upstream streaming feed.
//!
//! The socket speaks newline-delimited lines in two flavors: `key=value`
//! control lines (pipe-separated) during the handshake, and JSON data
//! records once streaming. Everything here is a pure function of
//! (state, input line) so the protocol is testable without sockets.

use crate::domain::errors::FeedError;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Fixed-point scale used for all wire prices (1e-9)
pub const PRICE_SCALE: u32 = 9;

/// Decode a fixed-point wire price into a Decimal
pub fn decode_price(raw: i64) -> Decimal {
    Decimal::new(raw, PRICE_SCALE)
}

/// Connection lifecycle. Each state waits on exactly one server line;
/// challenge receipt and the auth acknowledge are handled inside a single
/// transition rather than parked in their own states. `Closed` is a
/// graceful end, `Failed` is not; the owner decides whether to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    VersionReceived,
    AuthSent,
    Streaming,
    Closed,
    Failed,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Connecting => "Connecting",
            FeedState::VersionReceived => "VersionReceived",
            FeedState::AuthSent => "AuthSent",
            FeedState::Streaming => "Streaming",
            FeedState::Closed => "Closed",
            FeedState::Failed => "Failed",
        }
    }
}

/// What the upstream streams once subscribed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionSchema {
    Trades,
    OneMinuteBars,
}

impl SubscriptionSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionSchema::Trades => "trades",
            SubscriptionSchema::OneMinuteBars => "ohlcv-1m",
        }
    }
}

/// Parse a `key=value|key=value` control line
pub fn parse_control_line(line: &str) -> HashMap<&str, &str> {
    line.trim_end()
        .split('|')
        .filter_map(|part| part.split_once('='))
        .collect()
}

/// CRAM response: sha256 of `challenge|secret` in hex, suffixed with the
/// last characters of the API key so the server can locate the account.
pub fn cram_reply(challenge: &str, secret: &str, api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}", challenge, secret).as_bytes());
    let digest = hex::encode(hasher.finalize());
    let suffix_at = api_key.len().saturating_sub(5);
    format!("{}-{}", digest, &api_key[suffix_at..])
}

/// Outcome of feeding one control line through the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    pub next: FeedState,
    /// Lines to write back to the socket, in order
    pub send: Vec<String>,
}

/// Pure driver for the authentication/subscription handshake. Holds the
/// request parameters; the socket loop feeds it lines and writes whatever
/// it asks to send.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub api_key: String,
    pub api_secret: String,
    pub dataset: String,
    pub schema: SubscriptionSchema,
    pub instrument: String,
    /// Epoch ms the subscription should replay from
    pub start: i64,
}

impl Handshake {
    pub fn on_line(&self, state: FeedState, line: &str) -> Result<HandshakeStep, FeedError> {
        let fields = parse_control_line(line);

        match state {
            FeedState::Connecting => {
                if fields.contains_key("feed_version") {
                    Ok(HandshakeStep {
                        next: FeedState::VersionReceived,
                        send: vec![],
                    })
                } else {
                    Err(self.violation(state, line))
                }
            }
            FeedState::VersionReceived => match fields.get("cram") {
                Some(challenge) => {
                    let reply = cram_reply(challenge, &self.api_secret, &self.api_key);
                    let auth_line = format!(
                        "auth={}|dataset={}|encoding=json",
                        reply, self.dataset
                    );
                    Ok(HandshakeStep {
                        next: FeedState::AuthSent,
                        send: vec![auth_line],
                    })
                }
                None => Err(self.violation(state, line)),
            },
            FeedState::AuthSent => match fields.get("success") {
                Some(&"1") => {
                    let subscribe = format!(
                        "schema={}|symbols={}|start={}",
                        self.schema.as_str(),
                        self.instrument,
                        self.start
                    );
                    // The server sends no subscription ack; data records can
                    // begin immediately, so the next line already belongs to
                    // the stream and must not be consumed here.
                    Ok(HandshakeStep {
                        next: FeedState::Streaming,
                        send: vec![subscribe.clone(), "start_session=0".to_string()],
                    })
                }
                Some(&"0") => Err(FeedError::AuthRejected {
                    reason: fields.get("error").unwrap_or(&"unspecified").to_string(),
                }),
                _ => Err(self.violation(state, line)),
            },
            other => Err(self.violation(other, line)),
        }
    }

    fn violation(&self, state: FeedState, line: &str) -> FeedError {
        FeedError::ProtocolViolation {
            state: state.as_str().to_string(),
            line: line.trim_end().to_string(),
        }
    }
}

/// JSON data records streamed after the handshake. Unknown record types
/// decode into `Unknown` and are logged and skipped by the reader.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataRecord {
    /// instrument-id -> symbol mapping, sent before data for that id
    Mapping { instrument_id: u32, symbol: String },
    Trade {
        instrument_id: u32,
        /// Event time, epoch ms
        ts_event: i64,
        /// Fixed-point price, scale 1e-9
        price: i64,
        size: u64,
        #[serde(default)]
        side: Option<String>,
    },
    Bar {
        instrument_id: u32,
        /// Bucket start, epoch ms
        ts_event: i64,
        open: i64,
        high: i64,
        low: i64,
        close: i64,
        volume: u64,
    },
    Heartbeat {},
    #[serde(other)]
    Unknown,
}

impl DataRecord {
    pub fn parse(line: &str) -> Result<Self, FeedError> {
        serde_json::from_str(line).map_err(|e| FeedError::MalformedRecord {
            reason: e.to_string(),
        })
    }
}
