//! Local SOCKS5 proxy (RFC 1928, CONNECT only, NO AUTH)
//!
//! Listens for local application connections, performs the SOCKS5
//! handshake, opens a pipe to the selected relay and relays the connection
//! through it with the tunnel cipher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, Either};
use paypipe_core::{
    read_frame, write_frame, Hello, PipeRequest, PipeResponse, ServiceDescriptor,
    MAX_HANDSHAKE_BYTES,
};
use paypipe_crypto::SessionKey;
use paypipe_keystore::KeyVault;
use paypipe_relay::{copy_opening, copy_sealing};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{ClientError, Result};

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// What every proxied connection needs
#[derive(Clone)]
pub struct ProxyContext {
    pub vault: Arc<KeyVault>,
    pub service: ServiceDescriptor,
    pub session_key: SessionKey,
    /// Plaintext bytes relayed in both directions, reported in receipts
    pub usage: Arc<AtomicU64>,
    pub dial_timeout: Duration,
}

/// SOCKS5 proxy server
pub struct LocalProxy {
    listener: Option<TcpListener>,
    listen_addr: SocketAddr,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl LocalProxy {
    /// Bind the listener. Failure here is fatal for the client.
    pub async fn bind(addr: &str) -> Result<Self> {
        let bind_err = |source| ClientError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let listen_addr = listener.local_addr().map_err(bind_err)?;
        Ok(Self {
            listener: Some(listener),
            listen_addr,
            handle: None,
        })
    }

    /// Start serving connections.
    ///
    /// Returns immediately; the proxy runs in a background task.
    pub fn start(&mut self, ctx: ProxyContext) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        info!("SOCKS5 proxy listening on {}", self.listen_addr);

        let handle = tokio::spawn(async move {
            // Live connections die with this task
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("SOCKS5 connection from {}", peer_addr);
                            let ctx = ctx.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_socks5_connection(stream, ctx).await {
                                    debug!("SOCKS5 connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("SOCKS5 accept error: {}", e);
                        }
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
        });
        self.handle = Some(handle);
    }

    /// Stop the proxy
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("SOCKS5 proxy stopped");
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

impl Drop for LocalProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reply(stream: &mut TcpStream, code: u8) -> std::io::Result<()> {
    // VER | REP | RSV | ATYP | BND.ADDR (0.0.0.0) | BND.PORT (0)
    stream
        .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

/// Read the SOCKS5 greeting and CONNECT request; returns `host:port`
async fn read_connect_request(stream: &mut TcpStream) -> Result<String> {
    // VER (1) | NMETHODS (1) | METHODS (1..255)
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x05 {
        return Err(ClientError::Socks(format!(
            "unsupported version {}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        stream.write_all(&[0x05, 0xFF]).await?;
        return Err(ClientError::Socks("client does not offer NO AUTH".to_string()));
    }
    stream.write_all(&[0x05, 0x00]).await?;

    // VER (1) | CMD (1) | RSV (1) | ATYP (1) | DST.ADDR | DST.PORT (2)
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != 0x05 {
        return Err(ClientError::Socks("invalid request version".to_string()));
    }
    if request[1] != 0x01 {
        reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(ClientError::Socks(format!(
            "unsupported command {}",
            request[1]
        )));
    }

    let host = match request[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| ClientError::Socks("domain is not UTF-8".to_string()))?
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            format!("[{}]", std::net::Ipv6Addr::from(addr))
        }
        other => {
            reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(ClientError::Socks(format!("unsupported address type {}", other)));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

/// Dial the relay and ask it for a tunneled pipe to `target`
async fn open_pipe(ctx: &ProxyContext, target: &str) -> Result<TcpStream> {
    let mut relay = tokio::time::timeout(
        ctx.dial_timeout,
        TcpStream::connect(ctx.service.net_addr()),
    )
    .await
    .map_err(|_| ClientError::Timeout(format!("dial {}", ctx.service)))??;

    write_frame(
        &mut relay,
        &Hello::Pipe(PipeRequest {
            address: ctx.vault.address().to_string(),
            target: target.to_string(),
            is_raw: false,
        }),
    )
    .await?;

    let response: PipeResponse = tokio::time::timeout(
        ctx.dial_timeout,
        read_frame(&mut relay, MAX_HANDSHAKE_BYTES),
    )
    .await
    .map_err(|_| ClientError::Timeout(format!("pipe handshake with {}", ctx.service)))??;

    if response.address != ctx.service.id.as_str() {
        return Err(ClientError::RelayMismatch {
            expected: ctx.service.id.to_string(),
            got: response.address,
        });
    }
    Ok(relay)
}

async fn handle_socks5_connection(mut stream: TcpStream, ctx: ProxyContext) -> Result<()> {
    let target = read_connect_request(&mut stream).await?;
    debug!("SOCKS5 CONNECT to {}", target);

    let relay = match open_pipe(&ctx, &target).await {
        Ok(relay) => relay,
        Err(e) => {
            warn!("Pipe to {} via {} failed: {}", target, ctx.service, e);
            let _ = reply(&mut stream, REPLY_GENERAL_FAILURE).await;
            return Err(e);
        }
    };
    reply(&mut stream, REPLY_SUCCEEDED).await?;
    info!("Relaying {} via {}", target, ctx.service);

    let (local_r, local_w) = stream.into_split();
    let (relay_r, relay_w) = relay.into_split();

    let usage = &ctx.usage;
    let push = copy_sealing(local_r, relay_w, &ctx.session_key, None, |n| {
        usage.fetch_add(n, Ordering::Relaxed);
    });
    let pull = copy_opening(relay_r, local_w, &ctx.session_key, None, |n| {
        usage.fetch_add(n, Ordering::Relaxed);
    });

    // The first direction to finish ends the session; the other is dropped
    let first = match future::select(Box::pin(push), Box::pin(pull)).await {
        Either::Left((first, _)) | Either::Right((first, _)) => first,
    };

    debug!("SOCKS5 session to {} ended", target);
    first.map_err(ClientError::from)
}
