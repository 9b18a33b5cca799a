//! Integration tests for the relay side over loopback sockets
//!
//! 1. Raw pipe: customer created on attach, removed with its last pipe
//! 2. Tunneled pipe: sealed frames in, plaintext to the target
//! 3. Failed dial leaves no customer behind
//! 4. Malformed or silent handshakes drop the connection
//! 5. Pay channel: open checks, acks, unpaid eviction
//! 6. Pipes are served only while a pay channel is open

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use paypipe_core::{
    read_frame, read_raw_frame, sign_pay_receipt, unix_now, write_frame, write_raw_frame, Address,
    ClientControl, ControlMsg, Hello, License, PayChannelOpen, PipeRequest, PipeResponse,
    ServerConfig, MAX_CONTROL_BYTES, MAX_HANDSHAKE_BYTES,
};
use paypipe_crypto::{open_frame, seal_frame, KdfParams};
use paypipe_keystore::KeyVault;
use paypipe_relay::{RelayServer, MAX_SEALED_FRAME};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// =============================================================================
// HELPERS
// =============================================================================

fn unlocked_vault(password: &str) -> Arc<KeyVault> {
    let (mut vault, _) = KeyVault::create_account(password, KdfParams::light()).unwrap();
    assert!(vault.unlock(password));
    Arc::new(vault)
}

fn local_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

/// Relay that serves pipes without a pay channel
fn ungated_config() -> ServerConfig {
    ServerConfig {
        require_pay_channel: false,
        ..local_config()
    }
}

async fn start_relay(config: ServerConfig) -> RelayServer {
    paypipe_logging::init_test();
    let mut relay = RelayServer::bind(config, unlocked_vault("relay"))
        .await
        .unwrap();
    relay.start();
    relay
}

/// Target that echoes every connection back to itself
async fn echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

async fn send_pipe_request(relay: &RelayServer, caller: &str, target: &str, is_raw: bool) -> TcpStream {
    let mut conn = TcpStream::connect(relay.local_addr()).await.unwrap();
    write_frame(
        &mut conn,
        &Hello::Pipe(PipeRequest {
            address: caller.to_string(),
            target: target.to_string(),
            is_raw,
        }),
    )
    .await
    .unwrap();
    conn
}

async fn open_pipe(relay: &RelayServer, caller: &str, target: &str, is_raw: bool) -> TcpStream {
    let mut conn = send_pipe_request(relay, caller, target, is_raw).await;
    let response: PipeResponse = read_frame(&mut conn, MAX_HANDSHAKE_BYTES).await.unwrap();
    assert_eq!(response.address, relay.address().as_str());
    conn
}

/// True when the relay drops a raw pipe request without a response
async fn pipe_refused(relay: &RelayServer, caller: &str, target: &str) -> bool {
    let mut conn = send_pipe_request(relay, caller, target, true).await;
    matches!(
        tokio::time::timeout(
            Duration::from_secs(3),
            read_frame::<_, PipeResponse>(&mut conn, MAX_HANDSHAKE_BYTES)
        )
        .await,
        Ok(Err(_))
    )
}

async fn echo_round_trip(conn: &mut TcpStream, payload: &[u8]) {
    conn.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

/// True once the peer has closed the connection
async fn closed_by_peer(conn: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        tokio::time::timeout(Duration::from_secs(3), conn.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

fn license_for(user: &Address, start: u64, end: u64) -> License {
    License {
        user_addr: user.clone(),
        start,
        end,
        issuer_sig: String::new(),
    }
}

async fn open_pay_channel(relay: &RelayServer, user: &KeyVault, license: License) -> (TcpStream, ControlMsg) {
    let mut conn = TcpStream::connect(relay.local_addr()).await.unwrap();
    let sig = user.sign(&license.signable_bytes().unwrap()).unwrap();
    write_frame(&mut conn, &Hello::PayChannel(PayChannelOpen { sig, license }))
        .await
        .unwrap();
    let reply: ControlMsg = read_frame(&mut conn, MAX_CONTROL_BYTES).await.unwrap();
    (conn, reply)
}

async fn send_receipt(conn: &mut TcpStream, user: &KeyVault, relay: &Address, seq: u64, consumed: u64) -> ControlMsg {
    send_receipt_signed_by(conn, user, user, relay, seq, consumed).await
}

/// Receipt naming `user` but signed with `signer`'s key
async fn send_receipt_signed_by(
    conn: &mut TcpStream,
    user: &KeyVault,
    signer: &KeyVault,
    relay: &Address,
    seq: u64,
    consumed: u64,
) -> ControlMsg {
    let receipt =
        sign_pay_receipt(user.address(), relay, seq, consumed, |data| signer.sign(data)).unwrap();
    write_frame(conn, &ClientControl::Receipt(receipt)).await.unwrap();
    read_frame(conn, MAX_CONTROL_BYTES).await.unwrap()
}

async fn open_valid_channel(relay: &RelayServer, user: &KeyVault) -> TcpStream {
    let now = unix_now();
    let (conn, reply) =
        open_pay_channel(relay, user, license_for(user.address(), now - 10, now + 3600)).await;
    assert!(matches!(reply, ControlMsg::Accepted { .. }));
    conn
}

// =============================================================================
// 1. Raw pipes and the customer registry
// =============================================================================

#[tokio::test]
async fn test_raw_pipe_customer_lifecycle() {
    let relay = start_relay(ungated_config()).await;
    let registry = relay.registry();
    let target = echo_target().await;

    // Raw pipes take the claimed address as is
    let mut conn = open_pipe(&relay, "addr1", &target.to_string(), true).await;
    echo_round_trip(&mut conn, b"hello").await;

    assert!(registry.has_customer("addr1"));
    assert_eq!(registry.pipe_count("addr1"), 1);
    let pipes = registry.pipes_of("addr1");
    assert_eq!(pipes[0].0, target.to_string());
    assert!(pipes[0].1);
    assert!(wait_until(|| registry.usage("addr1") == 10).await);

    drop(conn);
    assert!(wait_until(|| !registry.has_customer("addr1")).await);
    assert_eq!(registry.customer_count(), 0);
}

#[tokio::test]
async fn test_customer_outlives_all_but_last_pipe() {
    let relay = start_relay(ungated_config()).await;
    let registry = relay.registry();
    let target = echo_target().await.to_string();
    let caller = unlocked_vault("caller");
    let addr = caller.address().to_string();

    let mut first = open_pipe(&relay, &addr, &target, true).await;
    let mut second = open_pipe(&relay, &addr, &target, true).await;
    echo_round_trip(&mut first, b"one").await;
    echo_round_trip(&mut second, b"two").await;
    assert_eq!(registry.pipe_count(&addr), 2);

    drop(first);
    assert!(wait_until(|| registry.pipe_count(&addr) == 1).await);
    assert!(registry.has_customer(&addr));

    drop(second);
    assert!(wait_until(|| !registry.has_customer(&addr)).await);
}

// =============================================================================
// 2. Tunneled pipe
// =============================================================================

#[tokio::test]
async fn test_tunneled_pipe_round_trip() {
    let relay = start_relay(ungated_config()).await;
    let target = echo_target().await;
    let caller = unlocked_vault("caller");
    let addr = caller.address().to_string();
    let key = caller.session_key_for(relay.address()).unwrap();

    let mut conn = open_pipe(&relay, &addr, &target.to_string(), false).await;
    let payload = b"sealed hello through the relay";
    write_raw_frame(&mut conn, &seal_frame(&key, payload).unwrap())
        .await
        .unwrap();

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        let frame = read_raw_frame(&mut conn, MAX_SEALED_FRAME)
            .await
            .unwrap()
            .expect("relay closed early");
        echoed.extend(open_frame(&key, &frame).unwrap());
    }
    assert_eq!(echoed, payload);
    assert!(!relay.registry().pipes_of(&addr)[0].1);
}

#[tokio::test]
async fn test_tunneled_pipe_wrong_key_closes() {
    let relay = start_relay(ungated_config()).await;
    let registry = relay.registry();
    let target = echo_target().await;
    let caller = unlocked_vault("caller");
    let addr = caller.address().to_string();
    let stranger = unlocked_vault("stranger");
    let wrong_key = stranger.session_key_for(relay.address()).unwrap();

    let mut conn = open_pipe(&relay, &addr, &target.to_string(), false).await;
    write_raw_frame(&mut conn, &seal_frame(&wrong_key, b"forged").unwrap())
        .await
        .unwrap();

    assert!(closed_by_peer(&mut conn).await);
    assert!(wait_until(|| !registry.has_customer(&addr)).await);
}

#[tokio::test]
async fn test_tunneled_pipe_needs_parsable_address() {
    let relay = start_relay(ungated_config()).await;
    let target = echo_target().await;

    let mut conn = send_pipe_request(&relay, "addr1", &target.to_string(), false).await;
    assert!(closed_by_peer(&mut conn).await);
    assert_eq!(relay.registry().customer_count(), 0);
}

// =============================================================================
// 3. Dial failure
// =============================================================================

#[tokio::test]
async fn test_failed_dial_leaves_no_customer() {
    let relay = start_relay(ungated_config()).await;
    let registry = relay.registry();
    let caller = unlocked_vault("caller");
    let addr = caller.address().to_string();

    // Nothing listens on port 1
    let mut conn = open_pipe(&relay, &addr, "127.0.0.1:1", true).await;
    assert!(closed_by_peer(&mut conn).await);
    assert!(!registry.has_customer(&addr));
    assert_eq!(registry.customer_count(), 0);
}

// =============================================================================
// 4. Malformed and silent handshakes
// =============================================================================

#[tokio::test]
async fn test_oversized_handshake_dropped() {
    let relay = start_relay(local_config()).await;
    let mut conn = TcpStream::connect(relay.local_addr()).await.unwrap();
    conn.write_all(&(MAX_HANDSHAKE_BYTES as u32 + 1).to_be_bytes())
        .await
        .unwrap();
    assert!(closed_by_peer(&mut conn).await);
}

#[tokio::test]
async fn test_silent_connection_dropped_after_handshake_timeout() {
    let relay = start_relay(ServerConfig {
        handshake_timeout_secs: 1,
        ..local_config()
    })
    .await;
    let mut conn = TcpStream::connect(relay.local_addr()).await.unwrap();

    // Half a length prefix, then nothing
    conn.write_all(&[0u8, 0u8]).await.unwrap();
    assert!(closed_by_peer(&mut conn).await);
    assert_eq!(relay.registry().customer_count(), 0);
}

// =============================================================================
// 5. Pay channel
// =============================================================================

#[tokio::test]
async fn test_pay_channel_accepts_and_acks() {
    let relay = start_relay(local_config()).await;
    let registry = relay.registry();
    let target = echo_target().await.to_string();
    let user = unlocked_vault("user");
    let addr = user.address().to_string();
    let now = unix_now();

    let (mut conn, reply) =
        open_pay_channel(&relay, &user, license_for(user.address(), now - 10, now + 3600)).await;
    assert_eq!(
        reply,
        ControlMsg::Accepted {
            relay: relay.address().to_string()
        }
    );
    assert!(registry.is_paid(&addr));

    let ack = send_receipt(&mut conn, &user, relay.address(), 1, 0).await;
    assert_eq!(ack, ControlMsg::Ack { seq: 1, used: 0 });

    let mut pipe = open_pipe(&relay, &addr, &target, true).await;
    echo_round_trip(&mut pipe, b"paid").await;

    // A clean bye ends the paid state but leaves running pipes alone
    write_frame(&mut conn, &ClientControl::Bye).await.unwrap();
    assert!(closed_by_peer(&mut conn).await);
    assert!(wait_until(|| !registry.is_paid(&addr)).await);
    echo_round_trip(&mut pipe, b"still up").await;
    assert!(pipe_refused(&relay, &addr, &target).await);
}

#[tokio::test]
async fn test_pay_channel_rejects_bad_signature() {
    let relay = start_relay(local_config()).await;
    let user = unlocked_vault("user");
    let now = unix_now();
    let license = license_for(user.address(), now - 10, now + 3600);

    let mut conn = TcpStream::connect(relay.local_addr()).await.unwrap();
    write_frame(
        &mut conn,
        &Hello::PayChannel(PayChannelOpen {
            sig: [0u8; 64],
            license,
        }),
    )
    .await
    .unwrap();
    let reply: ControlMsg = read_frame(&mut conn, MAX_CONTROL_BYTES).await.unwrap();
    assert!(matches!(reply, ControlMsg::Rejected { .. }));
    assert!(!relay.registry().is_paid(user.address().as_str()));
}

#[tokio::test]
async fn test_pay_channel_rejects_expired_license() {
    let relay = start_relay(local_config()).await;
    let user = unlocked_vault("user");
    let now = unix_now();

    let (_conn, reply) =
        open_pay_channel(&relay, &user, license_for(user.address(), now - 7200, now - 3600)).await;
    match reply {
        ControlMsg::Rejected { reason } => assert!(reason.contains("expired")),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_replayed_receipt_closes_channel() {
    let relay = start_relay(local_config()).await;
    let user = unlocked_vault("user");

    let mut conn = open_valid_channel(&relay, &user).await;
    assert!(matches!(
        send_receipt(&mut conn, &user, relay.address(), 1, 0).await,
        ControlMsg::Ack { .. }
    ));
    assert!(matches!(
        send_receipt(&mut conn, &user, relay.address(), 1, 0).await,
        ControlMsg::Close { .. }
    ));
}

#[tokio::test]
async fn test_forged_receipt_evicts_pipes() {
    let relay = start_relay(local_config()).await;
    let registry = relay.registry();
    let target = echo_target().await.to_string();
    let user = unlocked_vault("user");
    let stranger = unlocked_vault("stranger");
    let addr = user.address().to_string();

    let mut channel = open_valid_channel(&relay, &user).await;
    let mut pipe = open_pipe(&relay, &addr, &target, true).await;
    echo_round_trip(&mut pipe, b"before the forgery").await;

    let verdict =
        send_receipt_signed_by(&mut channel, &user, &stranger, relay.address(), 1, 0).await;
    match verdict {
        ControlMsg::Close { reason } => assert!(reason.contains("bad signature")),
        other => panic!("expected close, got {:?}", other),
    }

    assert!(closed_by_peer(&mut pipe).await);
    assert!(wait_until(|| !registry.has_customer(&addr)).await);
    assert!(!registry.is_paid(&addr));
    assert!(pipe_refused(&relay, &addr, &target).await);
}

#[tokio::test]
async fn test_receipt_timeout_closes_channel_and_evicts() {
    let relay = start_relay(ServerConfig {
        receipt_interval_secs: 1,
        ..local_config()
    })
    .await;
    let registry = relay.registry();
    let target = echo_target().await.to_string();
    let user = unlocked_vault("user");
    let addr = user.address().to_string();

    let mut channel = open_valid_channel(&relay, &user).await;
    let mut pipe = open_pipe(&relay, &addr, &target, true).await;
    echo_round_trip(&mut pipe, b"no receipts follow").await;

    // Three missed intervals
    let verdict: ControlMsg = tokio::time::timeout(
        Duration::from_secs(6),
        read_frame(&mut channel, MAX_CONTROL_BYTES),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        verdict,
        ControlMsg::Close {
            reason: "receipt timeout".to_string()
        }
    );

    assert!(closed_by_peer(&mut channel).await);
    assert!(closed_by_peer(&mut pipe).await);
    assert!(wait_until(|| !registry.has_customer(&addr)).await);
    assert!(!registry.is_paid(&addr));
}

#[tokio::test]
async fn test_unpaid_usage_evicts_customer() {
    let relay = start_relay(ServerConfig {
        unpaid_allowance_bytes: 16,
        ..local_config()
    })
    .await;
    let registry = relay.registry();
    let target = echo_target().await.to_string();
    let user = unlocked_vault("user");
    let addr = user.address().to_string();

    let mut channel = open_valid_channel(&relay, &user).await;

    let mut pipe = open_pipe(&relay, &addr, &target, true).await;
    echo_round_trip(&mut pipe, &[7u8; 100]).await;
    assert!(wait_until(|| registry.usage(&addr) == 200).await);

    let verdict = send_receipt(&mut channel, &user, relay.address(), 1, 0).await;
    assert_eq!(verdict, ControlMsg::Unpaid { used: 200, paid: 0 });

    assert!(closed_by_peer(&mut pipe).await);
    assert!(wait_until(|| !registry.has_customer(&addr)).await);

    // Reconnecting without a fresh channel gets nothing
    assert!(pipe_refused(&relay, &addr, &target).await);
    assert!(!registry.has_customer(&addr));
}

// =============================================================================
// 6. Pipes need a pay channel
// =============================================================================

#[tokio::test]
async fn test_pipe_refused_without_pay_channel() {
    let relay = start_relay(local_config()).await;
    let registry = relay.registry();
    let target = echo_target().await.to_string();
    let user = unlocked_vault("user");
    let addr = user.address().to_string();

    assert!(pipe_refused(&relay, &addr, &target).await);
    assert!(pipe_refused(&relay, "addr1", &target).await);
    assert_eq!(registry.customer_count(), 0);
    assert_eq!(registry.usage(&addr), 0);
}

#[tokio::test]
async fn test_pipe_served_once_channel_opens() {
    let relay = start_relay(local_config()).await;
    let registry = relay.registry();
    let target = echo_target().await.to_string();
    let user = unlocked_vault("user");
    let addr = user.address().to_string();

    assert!(pipe_refused(&relay, &addr, &target).await);

    let _channel = open_valid_channel(&relay, &user).await;
    let mut pipe = open_pipe(&relay, &addr, &target, true).await;
    echo_round_trip(&mut pipe, b"now paid").await;
    assert_eq!(registry.pipe_count(&addr), 1);
}
