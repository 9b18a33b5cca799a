//! Bidirectional byte relay
//!
//! A pipe has two directions, each running in its own task: push (caller to
//! target) and pull (target to caller). In tunneled mode the caller side
//! carries sealed frames: `u32 BE length || nonce || ciphertext || tag`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, Either};
use paypipe_core::{read_raw_frame, write_raw_frame};
use paypipe_crypto::{open_frame, seal_frame, SessionKey, NONCE_LEN, TAG_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::{RelayError, Result};

/// Largest plaintext chunk read per iteration
pub const PIPE_CHUNK: usize = 16 * 1024;

/// Largest sealed frame accepted on a tunneled pipe
pub const MAX_SEALED_FRAME: usize = PIPE_CHUNK + NONCE_LEN + TAG_LEN;

/// How the caller side of a pipe is encoded
#[derive(Debug, Clone)]
pub enum PipeMode {
    Raw,
    Tunneled(SessionKey),
}

/// Byte counters of one pipe.
///
/// `up` counts caller to target, `down` target to caller, both in plaintext
/// bytes. Once frozen the counters never change again.
#[derive(Debug, Default)]
pub struct PipeStats {
    up: AtomicU64,
    down: AtomicU64,
    frozen: AtomicBool,
}

impl PipeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_up(&self, n: u64) {
        if !self.frozen.load(Ordering::Acquire) {
            self.up.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_down(&self, n: u64) {
        if !self.frozen.load(Ordering::Acquire) {
            self.down.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn up(&self) -> u64 {
        self.up.load(Ordering::Relaxed)
    }

    pub fn down(&self) -> u64 {
        self.down.load(Ordering::Relaxed)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

/// Everything a running pipe reports to or listens on
pub struct PipeContext {
    pub stats: Arc<PipeStats>,
    /// Per-address usage meter
    pub meter: Arc<AtomicU64>,
    pub idle_timeout: Option<Duration>,
    pub kill: watch::Receiver<bool>,
}

async fn bounded<T, E, F>(idle: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<RelayError>,
{
    match idle {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(RelayError::IdleTimeout),
        },
        None => fut.await.map_err(Into::into),
    }
}

/// Copy bytes unchanged until EOF
pub async fn copy_plain<R, W, F>(
    mut reader: R,
    mut writer: W,
    idle: Option<Duration>,
    mut on_bytes: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; PIPE_CHUNK];
    loop {
        let n = bounded(idle, reader.read(&mut buf)).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
    }
}

/// Read plaintext, write sealed frames
pub async fn copy_sealing<R, W, F>(
    mut reader: R,
    mut writer: W,
    key: &SessionKey,
    idle: Option<Duration>,
    mut on_bytes: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; PIPE_CHUNK];
    loop {
        let n = bounded(idle, reader.read(&mut buf)).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        let sealed = seal_frame(key, &buf[..n])?;
        write_raw_frame(&mut writer, &sealed).await?;
        on_bytes(n as u64);
    }
}

/// Read sealed frames, write plaintext
pub async fn copy_opening<R, W, F>(
    mut reader: R,
    mut writer: W,
    key: &SessionKey,
    idle: Option<Duration>,
    mut on_bytes: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    loop {
        let Some(sealed) = bounded(idle, read_raw_frame(&mut reader, MAX_SEALED_FRAME)).await?
        else {
            let _ = writer.shutdown().await;
            return Ok(());
        };
        let plain = open_frame(key, &sealed)?;
        writer.write_all(&plain).await?;
        on_bytes(plain.len() as u64);
    }
}

async fn killed(mut kill: watch::Receiver<bool>) {
    loop {
        if *kill.borrow_and_update() {
            return;
        }
        if kill.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }
}

/// Relay between `caller` and `target` until either direction ends or the
/// pipe is evicted. Returns the terminal error, `None` for a clean EOF.
///
/// Both direction tasks have stopped and the counters are frozen when this
/// returns.
pub async fn run_pipe<C, T>(caller: C, target: T, mode: PipeMode, ctx: PipeContext) -> Option<RelayError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let PipeContext {
        stats,
        meter,
        idle_timeout,
        kill,
    } = ctx;

    let (caller_r, caller_w) = tokio::io::split(caller);
    let (target_r, target_w) = tokio::io::split(target);

    let push_stats = stats.clone();
    let push_meter = meter.clone();
    let on_push = move |n: u64| {
        push_stats.add_up(n);
        push_meter.fetch_add(n, Ordering::Relaxed);
    };
    let pull_stats = stats.clone();
    let pull_meter = meter;
    let on_pull = move |n: u64| {
        pull_stats.add_down(n);
        pull_meter.fetch_add(n, Ordering::Relaxed);
    };

    let (push, pull) = match mode {
        PipeMode::Raw => (
            tokio::spawn(copy_plain(caller_r, target_w, idle_timeout, on_push)),
            tokio::spawn(copy_plain(target_r, caller_w, idle_timeout, on_pull)),
        ),
        PipeMode::Tunneled(key) => {
            let push_key = key.clone();
            (
                tokio::spawn(async move {
                    copy_opening(caller_r, target_w, &push_key, idle_timeout, on_push).await
                }),
                tokio::spawn(async move {
                    copy_sealing(target_r, caller_w, &key, idle_timeout, on_pull).await
                }),
            )
        }
    };

    let push_abort = push.abort_handle();
    let pull_abort = pull.abort_handle();
    let directions = future::select(push, pull);
    let evicted = Box::pin(killed(kill));

    let outcome = match future::select(directions, evicted).await {
        Either::Left((Either::Left((first, other)), _))
        | Either::Left((Either::Right((first, other)), _)) => {
            other.abort();
            let _ = other.await;
            match first {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(RelayError::TaskFailed(e.to_string())),
            }
        }
        Either::Right(((), directions)) => {
            push_abort.abort();
            pull_abort.abort();
            // Wait for both tasks so no byte is counted after the freeze
            let other = match directions.await {
                Either::Left((_, other)) | Either::Right((_, other)) => other,
            };
            let _ = other.await;
            Some(RelayError::Evicted)
        }
    };

    stats.freeze();
    outcome
}
