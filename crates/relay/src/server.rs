//! Relay server accept loop

use std::net::SocketAddr;
use std::sync::Arc;

use paypipe_core::{Address, ServerConfig};
use paypipe_keystore::{KeyVault, KeystoreError};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::registry::Registry;
use crate::session::{handle_connection, SessionContext};
use crate::Result;

/// Relay server
///
/// Binds on [`RelayServer::bind`], serves from [`RelayServer::start`] in a
/// background task until [`RelayServer::stop`] or drop.
pub struct RelayServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    ctx: SessionContext,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl RelayServer {
    /// Bind the listener. The vault must already be unlocked.
    pub async fn bind(config: ServerConfig, vault: Arc<KeyVault>) -> Result<Self> {
        config.validate()?;
        if !vault.is_unlocked() {
            return Err(KeystoreError::Locked.into());
        }

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener: Some(listener),
            local_addr,
            ctx: SessionContext {
                vault,
                registry: Arc::new(Registry::new()),
                config: Arc::new(config),
            },
            handle: None,
        })
    }

    /// Start accepting connections.
    ///
    /// Returns immediately; the server runs in a background task.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        info!(
            "Relay {} listening on {}",
            self.ctx.vault.address(),
            self.local_addr
        );

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx).await {
                                debug!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        });
        self.handle = Some(handle);
    }

    /// Stop accepting. Running connections finish on their own.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Relay {} stopped", self.ctx.vault.address());
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn address(&self) -> &Address {
        self.ctx.vault.address()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.ctx.registry.clone()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}
