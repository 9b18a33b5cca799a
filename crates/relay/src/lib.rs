//! PayPipe Relay
//!
//! Server side of the network: accepts inbound connections, binds each one to
//! a customer address and a target, relays bytes in both directions and keeps
//! a per-customer payment ledger that can evict unpaid customers.

mod ledger;
mod pipe;
mod registry;
mod server;
mod session;

pub use ledger::{Ledger, Verdict};
pub use pipe::{
    copy_opening, copy_plain, copy_sealing, run_pipe, PipeContext, PipeMode, PipeStats,
    MAX_SEALED_FRAME, PIPE_CHUNK,
};
pub use registry::{Attached, PipeId, Registry};
pub use server::RelayServer;
pub use session::{handle_connection, SessionContext};

use paypipe_core::{ErrorClass, FrameError, PayPipeError};
use paypipe_crypto::EncryptError;
use paypipe_keystore::KeystoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Dial to {0} timed out")]
    DialTimeout(String),

    #[error("Dial to {target} failed: {reason}")]
    DialFailed { target: String, reason: String },

    #[error("Tunnel cipher error: {0}")]
    Cipher(#[from] EncryptError),

    #[error("Pipe evicted")]
    Evicted,

    #[error("Receipt rejected: {0}")]
    ReceiptRejected(String),

    #[error("Receipt timeout")]
    ReceiptTimeout,

    #[error("No pay channel open for {0}")]
    NotPaid(String),

    #[error("Unpaid usage: used {used}, paid {paid}")]
    Unpaid { used: u64, paid: u64 },

    #[error("Pay channel rejected: {0}")]
    ChannelRejected(String),

    #[error("Pipe task failed: {0}")]
    TaskFailed(String),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Core(#[from] PayPipeError),
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_)
            | Self::IdleTimeout
            | Self::DialTimeout(_)
            | Self::DialFailed { .. }
            | Self::TaskFailed(_) => ErrorClass::Network,
            Self::Frame(_) | Self::HandshakeTimeout | Self::Cipher(_) => ErrorClass::Protocol,
            Self::ReceiptRejected(_) | Self::ChannelRejected(_) => ErrorClass::Authorization,
            Self::Evicted
            | Self::ReceiptTimeout
            | Self::NotPaid(_)
            | Self::Unpaid { .. } => ErrorClass::Payment,
            Self::Keystore(e) => e.class(),
            Self::Core(e) => e.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
