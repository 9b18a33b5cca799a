//! PayPipe Core Types
//!
//! Identities, licenses, wire messages and framing shared by the relay server
//! and the client.

mod codec;
mod config;
mod error;
mod receipt_crypto;
mod types;
mod wire;

pub use codec::*;
pub use config::*;
pub use error::*;
pub use receipt_crypto::*;
pub use types::*;
pub use wire::*;
