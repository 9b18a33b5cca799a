//! Client side of the pay channel
//!
//! A dedicated control connection to the selected relay. After the open
//! handshake the monitor signs a cumulative receipt every interval and
//! watches the relay's replies; its outcome is delivered once over a oneshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use paypipe_core::{
    read_frame, sign_pay_receipt, write_frame, Address, ClientControl, ControlMsg, FrameError,
    Hello, License, PayChannelOpen, ServiceDescriptor, MAX_CONTROL_BYTES,
};
use paypipe_keystore::KeyVault;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{ClientError, Result};

pub struct PayChannel {
    conn: TcpStream,
    relay: Address,
    vault: Arc<KeyVault>,
    usage: Arc<AtomicU64>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    done: oneshot::Sender<Result<()>>,
}

impl PayChannel {
    /// Dial the relay and open the channel: send the license with the
    /// owner's signature over it, then wait for `Accepted` or `Rejected`.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        service: &ServiceDescriptor,
        vault: Arc<KeyVault>,
        license: &License,
        usage: Arc<AtomicU64>,
        interval: Duration,
        handshake_timeout: Duration,
        shutdown: watch::Receiver<bool>,
        done: oneshot::Sender<Result<()>>,
    ) -> Result<Self> {
        let mut conn = tokio::time::timeout(handshake_timeout, TcpStream::connect(service.net_addr()))
            .await
            .map_err(|_| ClientError::Timeout(format!("dial {}", service)))??;

        let sig = vault.sign(&license.signable_bytes()?)?;
        write_frame(
            &mut conn,
            &Hello::PayChannel(PayChannelOpen {
                sig,
                license: license.clone(),
            }),
        )
        .await?;

        let reply: ControlMsg =
            tokio::time::timeout(handshake_timeout, read_frame(&mut conn, MAX_CONTROL_BYTES))
                .await
                .map_err(|_| ClientError::Timeout(format!("pay channel to {}", service)))??;

        match reply {
            ControlMsg::Accepted { relay } if relay == service.id.as_str() => {}
            ControlMsg::Accepted { relay } => {
                return Err(ClientError::RelayMismatch {
                    expected: service.id.to_string(),
                    got: relay,
                })
            }
            ControlMsg::Rejected { reason } => return Err(ClientError::ChannelRejected(reason)),
            other => return Err(ClientError::UnexpectedMessage(format!("{:?}", other))),
        }
        info!("Pay channel to {} accepted", service);

        Ok(Self {
            conn,
            relay: service.id.clone(),
            vault,
            usage,
            interval,
            shutdown,
            done,
        })
    }

    pub fn relay(&self) -> &Address {
        &self.relay
    }

    /// Run until the channel fails or shutdown is requested, then deliver the
    /// outcome on the completion signal.
    pub async fn monitor(self) {
        let PayChannel {
            conn,
            relay,
            vault,
            usage,
            interval,
            mut shutdown,
            done,
        } = self;

        let (reader, mut writer) = conn.into_split();
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        let reader_task = tokio::spawn(read_control(reader, msg_tx));

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let mut seq = 0u64;

        let result: Result<()> = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    seq += 1;
                    let consumed = usage.load(Ordering::Relaxed);
                    let receipt = match sign_pay_receipt(vault.address(), &relay, seq, consumed, |data| vault.sign(data)) {
                        Ok(receipt) => receipt,
                        Err(e) => break Err(e.into()),
                    };
                    if let Err(e) = write_frame(&mut writer, &ClientControl::Receipt(receipt)).await {
                        break Err(e.into());
                    }
                    debug!("Sent receipt {} for {} bytes", seq, consumed);
                }
                msg = msg_rx.recv() => match msg {
                    Some(Ok(ControlMsg::Ack { seq, used })) => {
                        debug!("Relay acked receipt {} (used {})", seq, used);
                    }
                    Some(Ok(ControlMsg::Unpaid { used, paid })) => {
                        break Err(ClientError::Unpaid { used, paid });
                    }
                    Some(Ok(ControlMsg::Close { reason })) => {
                        break Err(ClientError::ChannelClosed(reason));
                    }
                    Some(Ok(other)) => {
                        break Err(ClientError::UnexpectedMessage(format!("{:?}", other)));
                    }
                    Some(Err(FrameError::Closed)) | None => {
                        break Err(ClientError::ChannelClosed("relay closed connection".to_string()));
                    }
                    Some(Err(e)) => break Err(e.into()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write_frame(&mut writer, &ClientControl::Bye).await;
                        info!("Pay channel to {} closed", relay);
                        break Ok(());
                    }
                }
            }
        };

        reader_task.abort();
        if let Err(e) = &result {
            warn!("Pay channel to {} ended: {}", relay, e);
        }
        let _ = done.send(result);
    }
}

async fn read_control(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<std::result::Result<ControlMsg, FrameError>>,
) {
    loop {
        let msg = read_frame(&mut reader, MAX_CONTROL_BYTES).await;
        let failed = msg.is_err();
        if tx.send(msg).await.is_err() || failed {
            return;
        }
    }
}
