//! Integration tests for the client over loopback sockets
//!
//! 1. Relay selection by ping
//! 2. License/account mismatch fails before any dial
//! 3. `running` ends with the pay channel's terminal error
//! 4. SOCKS5 through a real relay, then graceful shutdown
//! 5. Relay identity mismatch on a pipe gives a SOCKS failure reply

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use paypipe_client::{find_best_service, ping_service, Client, ClientError};
use paypipe_core::{
    read_frame, unix_now, write_frame, Address, ClientConfig, ClientControl, ControlMsg, Hello,
    License, PayPipeError, PipeResponse, Pong, ServerConfig, ServiceDescriptor, MAX_CONTROL_BYTES,
    MAX_HANDSHAKE_BYTES,
};
use paypipe_crypto::KdfParams;
use paypipe_keystore::{AccountRecord, KeyVault};
use paypipe_relay::RelayServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PASSWORD: &str = "correct horse";

// =============================================================================
// HELPERS
// =============================================================================

fn new_account() -> AccountRecord {
    // Client configs carry no KDF parameters
    KeyVault::create_account(PASSWORD, KdfParams::default())
        .unwrap()
        .1
}

fn random_address() -> Address {
    KeyVault::create_account("x", KdfParams::light())
        .unwrap()
        .0
        .address()
        .clone()
}

fn license_for(address: &str) -> License {
    License {
        user_addr: Address::parse(address).unwrap(),
        start: unix_now() - 60,
        end: unix_now() + 3600,
        issuer_sig: String::new(),
    }
}

fn client_config(record: &AccountRecord, license: &License, services: Vec<String>) -> ClientConfig {
    ClientConfig {
        addr: record.address.clone(),
        cipher: record.cipher.clone(),
        local_server: "127.0.0.1:0".to_string(),
        license: license.encode().unwrap(),
        services,
        probe_timeout_secs: 2,
        receipt_interval_secs: 1,
    }
}

async fn start_relay() -> RelayServer {
    paypipe_logging::init_test();
    let (vault, _) = KeyVault::create_account("relay", KdfParams::light()).unwrap();
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let mut relay = RelayServer::bind(config, Arc::new(vault)).await.unwrap();
    relay.start();
    relay
}

fn service_of(relay: &RelayServer) -> String {
    format!("{}@{}", relay.address(), relay.local_addr())
}

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

/// How the scripted relay answers the first receipt
#[derive(Clone, Copy)]
enum Script {
    Close(&'static str),
    Unpaid,
}

/// Relay stand-in: answers pings, accepts pay channels and ends them per
/// `script` on the first receipt. Pipe requests get a response naming a
/// different relay.
async fn scripted_relay(script: Script) -> (Address, SocketAddr) {
    let id = random_address();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = id.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let relay = relay.clone();
            tokio::spawn(async move {
                let _ = serve_scripted(stream, relay, script).await;
            });
        }
    });
    (id, addr)
}

async fn serve_scripted(mut stream: TcpStream, relay: Address, script: Script) -> Result<()> {
    let hello: Hello = read_frame(&mut stream, MAX_HANDSHAKE_BYTES).await?;
    match hello {
        Hello::Ping => {
            write_frame(&mut stream, &Pong { address: relay.to_string() }).await?;
        }
        Hello::Pipe(_) => {
            write_frame(
                &mut stream,
                &PipeResponse {
                    address: random_address().to_string(),
                },
            )
            .await?;
        }
        Hello::PayChannel(_) => {
            write_frame(&mut stream, &ControlMsg::Accepted { relay: relay.to_string() }).await?;
            let _: ClientControl = read_frame(&mut stream, MAX_CONTROL_BYTES).await?;
            let verdict = match script {
                Script::Close(reason) => ControlMsg::Close {
                    reason: reason.to_string(),
                },
                Script::Unpaid => ControlMsg::Unpaid { used: 500, paid: 0 },
            };
            write_frame(&mut stream, &verdict).await?;
        }
    }
    Ok(())
}

async fn socks_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
    let mut s = TcpStream::connect(proxy).await.unwrap();
    s.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    s.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let SocketAddr::V4(v4) = target else {
        panic!("IPv4 target expected");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    s.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    s.read_exact(&mut reply).await.unwrap();
    (s, reply[1])
}

// =============================================================================
// 1. Relay selection
// =============================================================================

#[tokio::test]
async fn test_ping_checks_relay_identity() {
    let relay = start_relay().await;

    let listed = ServiceDescriptor::parse(&service_of(&relay)).unwrap();
    assert!(ping_service(listed).await);

    let impostor =
        ServiceDescriptor::parse(&format!("{}@{}", random_address(), relay.local_addr())).unwrap();
    assert!(!ping_service(impostor).await);
}

#[tokio::test]
async fn test_find_best_service_skips_dead_relay() {
    let relay = start_relay().await;
    let dead = format!("{}@127.0.0.1:1", random_address());

    let best = find_best_service(&[dead, service_of(&relay)], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(&best.id, relay.address());
    assert!(best.reachable);
    assert!(best.latency.is_some());
}

#[tokio::test]
async fn test_no_reachable_service() {
    let record = new_account();
    let license = license_for(&record.address);
    let dead = format!("{}@127.0.0.1:1", random_address());

    let result = Client::new(&client_config(&record, &license, vec![dead]), PASSWORD).await;
    assert!(matches!(result, Err(ClientError::NoValidService)));
}

// =============================================================================
// 2. License/account mismatch
// =============================================================================

#[tokio::test]
async fn test_license_mismatch_never_dials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while listener.accept().await.is_ok() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let record = new_account();
    let someone_else = random_address();
    let license = license_for(someone_else.as_str());
    let service = format!("{}@{}", random_address(), relay_addr);

    let result = Client::new(&client_config(&record, &license, vec![service]), PASSWORD).await;
    assert!(matches!(
        result,
        Err(ClientError::Core(PayPipeError::AddressMismatch { .. }))
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

// =============================================================================
// 3. Pay channel outcome ends the session
// =============================================================================

#[tokio::test]
async fn test_running_returns_channel_error() {
    let (id, addr) = scripted_relay(Script::Close("license revoked")).await;
    let record = new_account();
    let license = license_for(&record.address);
    let config = client_config(&record, &license, vec![format!("{}@{}", id, addr)]);

    let client = Client::new(&config, PASSWORD).await.unwrap();
    assert_eq!(&client.service().id, &id);

    let outcome = tokio::time::timeout(Duration::from_secs(5), client.running())
        .await
        .unwrap();
    match outcome {
        Err(ClientError::ChannelClosed(reason)) => assert_eq!(reason, "license revoked"),
        other => panic!("expected channel close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_running_surfaces_unpaid() {
    let (id, addr) = scripted_relay(Script::Unpaid).await;
    let record = new_account();
    let license = license_for(&record.address);
    let config = client_config(&record, &license, vec![format!("{}@{}", id, addr)]);

    let client = Client::new(&config, PASSWORD).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), client.running())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        Err(ClientError::Unpaid { used: 500, paid: 0 })
    ));
}

// =============================================================================
// 4. SOCKS5 through a real relay
// =============================================================================

#[tokio::test]
async fn test_socks_through_relay_and_shutdown() {
    let relay = start_relay().await;
    let registry = relay.registry();
    let target = echo_target().await;
    let record = new_account();
    let license = license_for(&record.address);

    let client = Client::new(
        &client_config(&record, &license, vec![service_of(&relay)]),
        PASSWORD,
    )
    .await
    .unwrap();
    let proxy = client.local_addr();
    let shutdown = client.shutdown_handle();
    let session = tokio::spawn(client.running());

    let (mut conn, reply) = socks_connect(proxy, target).await;
    assert_eq!(reply, 0x00);

    let payload = b"through the paid pipe";
    conn.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, payload);

    assert!(registry.has_customer(&record.address));
    let pipes = registry.pipes_of(&record.address);
    assert_eq!(pipes.len(), 1);
    assert_eq!(pipes[0].0, target.to_string());
    assert!(!pipes[0].1);

    drop(conn);
    assert!(wait_until(|| !registry.has_customer(&record.address)).await);

    shutdown.shutdown();
    let outcome = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());
}

// =============================================================================
// 5. Relay identity mismatch on a pipe
// =============================================================================

#[tokio::test]
async fn test_pipe_to_wrong_relay_fails_socks_request() {
    let (id, addr) = scripted_relay(Script::Close("done")).await;
    let record = new_account();
    let license = license_for(&record.address);
    let mut config = client_config(&record, &license, vec![format!("{}@{}", id, addr)]);
    config.receipt_interval_secs = 30;

    let client = Client::new(&config, PASSWORD).await.unwrap();
    let proxy = client.local_addr();
    let shutdown = client.shutdown_handle();
    let session = tokio::spawn(client.running());

    let target = echo_target().await;
    let (_conn, reply) = socks_connect(proxy, target).await;
    assert_eq!(reply, 0x01);

    shutdown.shutdown();
    assert!(session.await.unwrap().is_ok());
}
