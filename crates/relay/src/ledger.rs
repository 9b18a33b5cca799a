//! Server side of the pay channel
//!
//! The client proves license ownership once, then sends signed cumulative
//! receipts. Each receipt is checked against the metered usage of the
//! client's address; usage beyond `paid + allowance` evicts the customer.
//! Pipes are served only while their address has an open channel, and a
//! channel that ends any way other than a client bye takes its pipes down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use paypipe_core::{
    read_frame, unix_now, verify_license_proof, verify_pay_receipt, write_frame, Address,
    ClientControl, ControlMsg, PayChannelOpen, PayReceipt, MAX_CONTROL_BYTES,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::session::SessionContext;
use crate::{RelayError, Result};

/// Outcome of one accepted receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack { seq: u64, used: u64 },
    Unpaid { used: u64, paid: u64 },
}

/// Receipt bookkeeping for one pay channel
#[derive(Debug)]
pub struct Ledger {
    user: Address,
    relay: Address,
    last_seq: u64,
    paid: u64,
    allowance: u64,
}

impl Ledger {
    pub fn new(user: Address, relay: Address, allowance: u64) -> Self {
        Self {
            user,
            relay,
            last_seq: 0,
            paid: 0,
            allowance,
        }
    }

    pub fn paid(&self) -> u64 {
        self.paid
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Check a receipt and compare the paid amount with `used`.
    ///
    /// A rejected receipt leaves the ledger unchanged.
    pub fn apply(&mut self, receipt: &PayReceipt, used: u64) -> Result<Verdict> {
        if receipt.user != self.user {
            return Err(RelayError::ReceiptRejected(format!(
                "receipt user {} is not channel owner",
                receipt.user
            )));
        }
        if receipt.relay != self.relay {
            return Err(RelayError::ReceiptRejected(format!(
                "receipt names relay {}",
                receipt.relay
            )));
        }
        if receipt.seq <= self.last_seq {
            return Err(RelayError::ReceiptRejected(format!(
                "seq {} not above {}",
                receipt.seq, self.last_seq
            )));
        }
        if receipt.consumed < self.paid {
            return Err(RelayError::ReceiptRejected(format!(
                "consumed {} below paid {}",
                receipt.consumed, self.paid
            )));
        }
        if !verify_pay_receipt(receipt) {
            return Err(RelayError::ReceiptRejected("bad signature".to_string()));
        }

        self.last_seq = receipt.seq;
        self.paid = receipt.consumed;

        if used > self.paid.saturating_add(self.allowance) {
            Ok(Verdict::Unpaid {
                used,
                paid: self.paid,
            })
        } else {
            Ok(Verdict::Ack {
                seq: receipt.seq,
                used,
            })
        }
    }
}

/// Validate the opening proof and the license window
fn check_open(open: &PayChannelOpen, now: u64) -> Result<()> {
    if !verify_license_proof(&open.license, &open.sig) {
        return Err(RelayError::ChannelRejected("invalid license signature".to_string()));
    }
    if !open.license.is_valid_at(now) {
        return Err(RelayError::ChannelRejected("license expired".to_string()));
    }
    Ok(())
}

/// Run a pay channel on an accepted connection until the client says bye, a
/// receipt is rejected, or the customer runs out of credit.
pub async fn serve_pay_channel<S>(
    stream: &mut S,
    open: PayChannelOpen,
    ctx: &SessionContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = open.license.user_addr.clone();
    let relay = ctx.vault.address().clone();

    if let Err(e) = check_open(&open, unix_now()) {
        warn!("Rejecting pay channel from {}: {}", user, e);
        write_frame(
            stream,
            &ControlMsg::Rejected {
                reason: e.to_string(),
            },
        )
        .await?;
        return Err(e);
    }

    // Paid before the client hears Accepted, so its first pipe finds it
    let mut channel = OpenChannel::new(ctx, &user);
    write_frame(
        stream,
        &ControlMsg::Accepted {
            relay: relay.to_string(),
        },
    )
    .await?;
    info!("Pay channel open for {}", user);

    let mut ledger = Ledger::new(user.clone(), relay, ctx.config.unpaid_allowance_bytes);
    let deadline = ctx.config.receipt_deadline();

    let result = loop {
        let msg: ClientControl =
            match tokio::time::timeout(deadline, read_frame(stream, MAX_CONTROL_BYTES)).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => break Err(e.into()),
                Err(_) => {
                    let _ = write_frame(
                        stream,
                        &ControlMsg::Close {
                            reason: "receipt timeout".to_string(),
                        },
                    )
                    .await;
                    break Err(RelayError::ReceiptTimeout);
                }
            };

        let receipt = match msg {
            ClientControl::Bye => {
                debug!("Pay channel for {} closed by client", user);
                break Ok(());
            }
            ClientControl::Receipt(receipt) => receipt,
        };

        let used = channel.usage();
        match ledger.apply(&receipt, used) {
            Ok(Verdict::Ack { seq, used }) => {
                debug!("Receipt {} from {}: used {}, paid {}", seq, user, used, ledger.paid());
                if let Err(e) = write_frame(stream, &ControlMsg::Ack { seq, used }).await {
                    break Err(e.into());
                }
            }
            Ok(Verdict::Unpaid { used, paid }) => {
                warn!("Customer {} unpaid (used {}, paid {})", user, used, paid);
                let _ = write_frame(stream, &ControlMsg::Unpaid { used, paid }).await;
                break Err(RelayError::Unpaid { used, paid });
            }
            Err(e) => {
                warn!("Rejected receipt from {}: {}", user, e);
                let _ = write_frame(
                    stream,
                    &ControlMsg::Close {
                        reason: e.to_string(),
                    },
                )
                .await;
                break Err(e);
            }
        }
    };

    if result.is_ok() {
        channel.clean_exit();
    }
    info!(
        "Pay channel for {} ended at seq {}, paid {}",
        user,
        ledger.last_seq(),
        ledger.paid()
    );
    result
}

/// Paid state of one accepted channel.
///
/// Dropping it forgets the channel; unless the client said bye, every pipe
/// of the address is evicted with it.
struct OpenChannel<'a> {
    ctx: &'a SessionContext,
    user: &'a Address,
    meter: Option<Arc<AtomicU64>>,
    clean: bool,
}

impl<'a> OpenChannel<'a> {
    fn new(ctx: &'a SessionContext, user: &'a Address) -> Self {
        ctx.registry.open_channel(user.as_str());
        Self {
            ctx,
            user,
            meter: Some(ctx.registry.meter(user.as_str())),
            clean: false,
        }
    }

    /// Bytes relayed for the address so far
    fn usage(&self) -> u64 {
        self.meter
            .as_ref()
            .map_or(0, |meter| meter.load(Ordering::Relaxed))
    }

    fn clean_exit(&mut self) {
        self.clean = true;
    }
}

impl Drop for OpenChannel<'_> {
    fn drop(&mut self) {
        let evicted = self
            .ctx
            .registry
            .close_channel(self.user.as_str(), !self.clean);
        if evicted > 0 {
            warn!("Evicted {} pipes of {}", evicted, self.user);
        }
        if let Some(meter) = self.meter.take() {
            self.ctx.registry.release_meter(self.user.as_str(), meter);
        }
    }
}
