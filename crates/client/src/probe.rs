//! Relay selection by measured latency

use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use paypipe_core::{read_frame, write_frame, Hello, Pong, ServiceDescriptor, MAX_HANDSHAKE_BYTES};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Probe every descriptor concurrently and return the one with the lowest
/// latency among those whose probe succeeded.
///
/// Each probe is bounded by `limit`; a probe that returns `false` or runs out
/// of time drops its descriptor.
pub async fn select_fastest<F, Fut>(
    descriptors: Vec<ServiceDescriptor>,
    limit: Duration,
    probe: F,
) -> Option<ServiceDescriptor>
where
    F: Fn(ServiceDescriptor) -> Fut,
    Fut: Future<Output = bool>,
{
    let reachable = Mutex::new(Vec::with_capacity(descriptors.len()));

    join_all(descriptors.into_iter().map(|mut desc| {
        let probing = probe(desc.clone());
        let reachable = &reachable;
        async move {
            let started = Instant::now();
            match tokio::time::timeout(limit, probing).await {
                Ok(true) => {
                    let latency = started.elapsed();
                    debug!("Service {} is ok ({}ms)", desc, latency.as_millis());
                    desc.latency = Some(latency);
                    desc.reachable = true;
                    reachable.lock().push(desc);
                }
                Ok(false) => debug!("Service {} is invalid", desc),
                Err(_) => debug!("Service {} timed out", desc),
            }
        }
    }))
    .await;

    let mut reachable = reachable.into_inner();
    reachable.sort_by_key(|d| d.latency);
    reachable.into_iter().next()
}

/// Dial a relay and check it answers a ping with the address it is listed
/// under
pub async fn ping_service(desc: ServiceDescriptor) -> bool {
    let mut conn = match TcpStream::connect(desc.net_addr()).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!("Service {} unreachable: {}", desc, e);
            return false;
        }
    };
    if let Err(e) = write_frame(&mut conn, &Hello::Ping).await {
        debug!("Ping to {} failed: {}", desc, e);
        return false;
    }
    match read_frame::<_, Pong>(&mut conn, MAX_HANDSHAKE_BYTES).await {
        Ok(pong) if pong.address == desc.id.as_str() => true,
        Ok(pong) => {
            warn!("Service {} answered as {}", desc, pong.address);
            false
        }
        Err(e) => {
            debug!("Ping to {} failed: {}", desc, e);
            false
        }
    }
}

/// Parse the configured candidates and pick the fastest live relay.
/// Unparsable entries are skipped.
pub async fn find_best_service(candidates: &[String], limit: Duration) -> Option<ServiceDescriptor> {
    let descriptors: Vec<ServiceDescriptor> = candidates
        .iter()
        .filter_map(|text| match ServiceDescriptor::parse(text) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!("Skipping service {}: {}", text, e);
                None
            }
        })
        .collect();

    let best = select_fastest(descriptors, limit, ping_service).await;
    match &best {
        Some(desc) => info!(
            "Selected service {} ({}ms)",
            desc,
            desc.latency.unwrap_or_default().as_millis()
        ),
        None => warn!("No reachable service among {} candidates", candidates.len()),
    }
    best
}
