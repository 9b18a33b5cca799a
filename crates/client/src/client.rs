//! Client session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use paypipe_core::{Address, ClientConfig, License, ServiceDescriptor};
use paypipe_crypto::SessionKey;
use paypipe_keystore::KeyVault;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::paychannel::PayChannel;
use crate::probe::find_best_service;
use crate::proxy::{LocalProxy, ProxyContext};
use crate::{ClientError, Result};

/// Bound on dialing a relay and on each handshake reply
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests a graceful end of [`Client::running`]
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// A running client: account, selected relay, local proxy and pay channel
pub struct Client {
    vault: Arc<KeyVault>,
    license: License,
    service: ServiceDescriptor,
    session_key: SessionKey,
    proxy: LocalProxy,
    usage: Arc<AtomicU64>,
    receipt_interval: Duration,
    shutdown: Arc<watch::Sender<bool>>,
    pay_channel: Option<PayChannel>,
    done: Option<oneshot::Receiver<Result<()>>>,
}

impl Client {
    /// Build a client from its configuration.
    ///
    /// Unlocks the account, checks the license belongs to it, selects the
    /// fastest configured relay and opens the pay channel. A license issued
    /// to another address fails before anything is dialed.
    pub async fn new(config: &ClientConfig, password: &str) -> Result<Self> {
        config.validate()?;

        let mut vault = KeyVault::from_strings(&config.addr, &config.cipher)?;
        if !vault.unlock(password) {
            return Err(ClientError::UnlockFailed);
        }
        let license = License::parse(&config.license)?;
        license.check_owner(vault.address())?;

        let service = find_best_service(&config.services, config.probe_timeout())
            .await
            .ok_or(ClientError::NoValidService)?;

        let mut client = Self::new_without_check(
            &config.local_server,
            Arc::new(vault),
            license,
            service,
            config.receipt_interval(),
        )
        .await?;
        client.create_pay_channel().await?;
        Ok(client)
    }

    /// Build a client against a known relay without probing.
    ///
    /// The pay channel is not opened; call [`Client::create_pay_channel`].
    pub async fn new_without_check(
        local_server: &str,
        vault: Arc<KeyVault>,
        license: License,
        service: ServiceDescriptor,
        receipt_interval: Duration,
    ) -> Result<Self> {
        license.check_owner(vault.address())?;
        let session_key = vault.session_key_for(&service.id)?;
        let proxy = LocalProxy::bind(local_server).await?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            vault,
            license,
            service,
            session_key,
            proxy,
            usage: Arc::new(AtomicU64::new(0)),
            receipt_interval,
            shutdown: Arc::new(shutdown),
            pay_channel: None,
            done: None,
        })
    }

    /// Open the pay channel to the selected relay, replacing any previous one
    pub async fn create_pay_channel(&mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let channel = PayChannel::open(
            &self.service,
            self.vault.clone(),
            &self.license,
            self.usage.clone(),
            self.receipt_interval,
            HANDSHAKE_TIMEOUT,
            self.shutdown.subscribe(),
            done_tx,
        )
        .await?;
        self.pay_channel = Some(channel);
        self.done = Some(done_rx);
        Ok(())
    }

    /// Serve the local proxy until the pay channel ends.
    ///
    /// Returns the channel's outcome: `Ok(())` after a requested shutdown,
    /// the terminal error otherwise.
    pub async fn running(mut self) -> Result<()> {
        let (Some(channel), Some(done)) = (self.pay_channel.take(), self.done.take()) else {
            return Err(ClientError::NoPayChannel);
        };

        tokio::spawn(channel.monitor());
        self.proxy.start(ProxyContext {
            vault: self.vault.clone(),
            service: self.service.clone(),
            session_key: self.session_key.clone(),
            usage: self.usage.clone(),
            dial_timeout: HANDSHAKE_TIMEOUT,
        });
        info!(
            "Client {} serving on {} via {}",
            self.vault.address(),
            self.proxy.listen_addr(),
            self.service
        );

        let outcome = done.await.unwrap_or_else(|_| {
            Err(ClientError::ChannelClosed("monitor stopped".to_string()))
        });
        self.proxy.stop();
        match &outcome {
            Ok(()) => info!(
                "Client session ended after {} bytes",
                self.usage.load(Ordering::Relaxed)
            ),
            Err(e) => warn!("Client session failed: {}", e),
        }
        outcome
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.proxy.listen_addr()
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn address(&self) -> &Address {
        self.vault.address()
    }

    /// Plaintext bytes relayed so far
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}
