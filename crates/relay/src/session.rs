//! Per-connection handshake
//!
//! Every inbound connection starts with one bounded [`Hello`] frame that
//! decides what the connection is: a pipe, a pay channel or a ping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use paypipe_core::{
    read_frame, write_frame, Address, Hello, PipeRequest, PipeResponse, Pong, ServerConfig,
    MAX_HANDSHAKE_BYTES,
};
use paypipe_keystore::KeyVault;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::ledger::serve_pay_channel;
use crate::pipe::{run_pipe, PipeContext, PipeMode, PipeStats};
use crate::registry::{PipeId, Registry};
use crate::{RelayError, Result};

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Shared state handed to every connection task
#[derive(Clone)]
pub struct SessionContext {
    pub vault: Arc<KeyVault>,
    pub registry: Arc<Registry>,
    pub config: Arc<ServerConfig>,
}

/// Detaches a pipe from the registry on every exit path and logs its final
/// counters.
struct PipeGuard {
    registry: Arc<Registry>,
    address: String,
    target: String,
    id: PipeId,
    stats: Arc<PipeStats>,
    error: Option<RelayError>,
}

impl Drop for PipeGuard {
    fn drop(&mut self) {
        self.stats.freeze();
        let removed = self.registry.detach(&self.address, self.id);
        match &self.error {
            Some(e) => info!(
                "Pipe {} {} -> {} closed (up {}, down {}): {}",
                self.id,
                self.address,
                self.target,
                self.stats.up(),
                self.stats.down(),
                e
            ),
            None => info!(
                "Pipe {} {} -> {} closed (up {}, down {})",
                self.id,
                self.address,
                self.target,
                self.stats.up(),
                self.stats.down()
            ),
        }
        if removed {
            debug!("Customer {} has no pipes left", self.address);
        }
    }
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))
}

/// Serve one inbound connection to completion
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
) -> Result<()> {
    if let Err(e) = enable_keepalive(&stream) {
        debug!("Keep-alive not enabled for {}: {}", peer, e);
    }

    let hello: Hello = tokio::time::timeout(
        ctx.config.handshake_timeout(),
        read_frame(&mut stream, MAX_HANDSHAKE_BYTES),
    )
    .await
    .map_err(|_| RelayError::HandshakeTimeout)??;

    match hello {
        Hello::Ping => {
            write_frame(
                &mut stream,
                &Pong {
                    address: ctx.vault.address().to_string(),
                },
            )
            .await?;
            Ok(())
        }
        Hello::Pipe(request) => serve_pipe(stream, peer, request, &ctx).await,
        Hello::PayChannel(open) => serve_pay_channel(&mut stream, open, &ctx).await,
    }
}

async fn serve_pipe(
    mut stream: TcpStream,
    peer: SocketAddr,
    request: PipeRequest,
    ctx: &SessionContext,
) -> Result<()> {
    let paid_only = ctx.config.require_pay_channel;
    if paid_only && !ctx.registry.is_paid(&request.address) {
        warn!("Refusing pipe from {} ({}): no pay channel", request.address, peer);
        return Err(RelayError::NotPaid(request.address));
    }

    // Raw pipes are keyed by the claimed address as sent; only the tunnel
    // key needs it to parse
    let mode = if request.is_raw {
        PipeMode::Raw
    } else {
        let caller = Address::parse(&request.address)?;
        PipeMode::Tunneled(ctx.vault.session_key_for(&caller)?)
    };

    write_frame(
        &mut stream,
        &PipeResponse {
            address: ctx.vault.address().to_string(),
        },
    )
    .await?;

    // Dial before touching the registry: a failed dial leaves no customer
    let target = dial(&request.target, ctx.config.dial_timeout()).await?;
    debug!("{} ({}) dialed {}", request.address, peer, request.target);

    let attached = if paid_only {
        ctx.registry
            .attach_paid(&request.address, &request.target, request.is_raw)
            .ok_or_else(|| RelayError::NotPaid(request.address.clone()))?
    } else {
        ctx.registry
            .attach(&request.address, &request.target, request.is_raw)
    };
    let mut guard = PipeGuard {
        registry: ctx.registry.clone(),
        address: request.address.clone(),
        target: request.target.clone(),
        id: attached.id,
        stats: attached.stats.clone(),
        error: None,
    };

    let pipe_ctx = PipeContext {
        stats: attached.stats,
        meter: attached.meter,
        idle_timeout: ctx.config.idle_timeout(),
        kill: attached.kill,
    };
    guard.error = run_pipe(stream, target, mode, pipe_ctx).await;
    Ok(())
}

async fn dial(target: &str, limit: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            warn!("Dial to {} failed: {}", target, e);
            Err(RelayError::DialFailed {
                target: target.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => Err(RelayError::DialTimeout(target.to_string())),
    }
}
