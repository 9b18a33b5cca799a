//! PayPipe Client
//!
//! Picks the fastest relay, opens a pay channel to it and serves a local
//! SOCKS5 proxy whose connections are tunneled through the relay.
//!
//! ## Flow
//!
//! 1. Bind the local proxy listener
//! 2. Unlock the account and check the license belongs to it
//! 3. Probe all configured relays, keep the lowest-latency one
//! 4. Derive the session key and open the pay channel
//! 5. [`Client::running`] serves the proxy until the pay channel ends

mod client;
mod paychannel;
mod probe;
mod proxy;

pub use client::{Client, ShutdownHandle};
pub use paychannel::PayChannel;
pub use probe::{find_best_service, ping_service, select_fastest};
pub use proxy::{LocalProxy, ProxyContext};

use paypipe_core::{ErrorClass, FrameError, PayPipeError};
use paypipe_keystore::KeystoreError;
use paypipe_relay::RelayError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind local proxy on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Wrong password for account")]
    UnlockFailed,

    #[error("No valid service")]
    NoValidService,

    #[error("Relay answered as {got}, expected {expected}")]
    RelayMismatch { expected: String, got: String },

    #[error("Pay channel rejected: {0}")]
    ChannelRejected(String),

    #[error("Pay channel closed: {0}")]
    ChannelClosed(String),

    #[error("Pay channel not open")]
    NoPayChannel,

    #[error("Unpaid usage: used {used}, paid {paid}")]
    Unpaid { used: u64, paid: u64 },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("SOCKS5 error: {0}")]
    Socks(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Core(#[from] PayPipeError),
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::Timeout(_) => ErrorClass::Network,
            Self::Frame(_) | Self::UnexpectedMessage(_) | Self::Socks(_) => ErrorClass::Protocol,
            Self::UnlockFailed | Self::RelayMismatch { .. } | Self::ChannelRejected(_) => {
                ErrorClass::Authorization
            }
            Self::ChannelClosed(_) | Self::NoPayChannel | Self::Unpaid { .. } => {
                ErrorClass::Payment
            }
            Self::Bind { .. } | Self::NoValidService => ErrorClass::Startup,
            Self::Relay(e) => e.class(),
            Self::Keystore(e) => e.class(),
            Self::Core(e) => e.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
