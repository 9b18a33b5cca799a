//! Wire messages
//!
//! Every message is a JSON document carried in one length-prefixed frame
//! (see [`crate::codec`]).

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::{License, PayReceipt, Signature};

/// Frame cap for the first frame of a connection
pub const MAX_HANDSHAKE_BYTES: usize = 4096;

/// Frame cap on the pay channel
pub const MAX_CONTROL_BYTES: usize = 64 * 1024;

/// First frame of every inbound connection, tagged by `"cmd"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Hello {
    /// Relay a TCP session to `target`
    Pipe(PipeRequest),
    /// Open the payment control channel
    PayChannel(PayChannelOpen),
    /// Liveness and identity probe
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeRequest {
    /// Caller's claimed address
    pub address: String,
    /// `host:port` to dial
    pub target: String,
    /// Copy bytes without the tunnel cipher
    pub is_raw: bool,
}

/// Relay's reply to [`Hello::Pipe`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeResponse {
    pub address: String,
}

/// Relay's reply to [`Hello::Ping`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayChannelOpen {
    /// Owner signature over the license's serialized form
    #[serde(with = "BigArray")]
    pub sig: Signature,
    pub license: License,
}

/// Relay → client messages on the pay channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMsg {
    Accepted { relay: String },
    Rejected { reason: String },
    Ack { seq: u64, used: u64 },
    Unpaid { used: u64, paid: u64 },
    Close { reason: String },
}

/// Client → relay messages on the pay channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    Receipt(PayReceipt),
    Bye,
}
