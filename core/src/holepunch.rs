//! Hole-Punch Engine: multi-strategy UDP path establishment, tried in
//! a fixed order: LAN direct, enhanced simultaneous send, direct public
//! handshake, then port prediction, each with its own retry/timing policy.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

use crate::error::{Error, Result};
use crate::mapping::NetworkInfo;

const LAN_WINDOW: Duration = Duration::from_secs(2);
const ENHANCED_COORDINATION_DELAY: Duration = Duration::from_millis(100);
const ENHANCED_SEND_CADENCE: Duration = Duration::from_millis(50);
const ENHANCED_WINDOW: Duration = Duration::from_secs(3);
const DIRECT_RETRY_COUNT: u32 = 5;
const DIRECT_READ_WINDOW: Duration = Duration::from_secs(3);
const DIRECT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const PREDICTION_DELTAS: [i32; 11] = [0, 1, -1, 2, -2, 3, -3, 4, -4, 5, -5];
const PREDICTION_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LanDirect,
    EnhancedSimultaneous,
    DirectPublic,
    PortPrediction,
}

/// A confirmed UDP path to a peer, with at least one observed bidirectional
/// exchange.
pub struct HolePunchPath {
    pub socket: UdpSocket,
    pub confirmed_remote: SocketAddr,
    pub strategy: Strategy,
}

fn magic_token(role: &str) -> Vec<u8> {
    format!("ENHANCED_HOLE_PUNCH_{role}").into_bytes()
}

fn is_from(expected: SocketAddr, observed: SocketAddr) -> bool {
    // NAT re-mapping can shift the observed source port even on a confirmed
    // path (most visible during port prediction), so only the IP must match.
    observed.ip() == expected.ip()
}

/// Binds a UDP socket, preferring `preferred_port` via SO_REUSEADDR/
/// SO_REUSEPORT where the platform supports it, so the same local port used
/// during NAT probing can be reused for the punch; falls back to an
/// OS-assigned port otherwise.
fn bind_reusable(preferred_port: u16) -> Result<std::net::UdpSocket> {
    let domain = Domain::IPV4;
    let socket = Socket::new(domain, Type::DGRAM, None)
        .map_err(|e| Error::hole_punch(format!("socket() failed: {e}")))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| Error::hole_punch(format!("SO_REUSEADDR failed: {e}")))?;
    #[cfg(unix)]
    let _ = socket.set_reuse_port(true);

    let addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), preferred_port);
    if socket.bind(&addr.into()).is_err() {
        // Preferred port unavailable (or platform lacks reuse support);
        // fall back to an OS-assigned port.
        let fallback: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        socket
            .bind(&fallback.into())
            .map_err(|e| Error::hole_punch(format!("fallback bind failed: {e}")))?;
    }

    socket.set_nonblocking(true).ok();
    Ok(socket.into())
}

fn to_tokio(socket: std::net::UdpSocket) -> Result<UdpSocket> {
    UdpSocket::from_std(socket).map_err(|e| Error::hole_punch(format!("socket setup failed: {e}")))
}

/// Sends `token` once to `target` then listens for `window`, returning the
/// confirmed source address of the first datagram observed to come from
/// `target`'s IP.
async fn send_and_listen(
    socket: &UdpSocket,
    target: SocketAddr,
    token: &[u8],
    window: Duration,
) -> Option<SocketAddr> {
    if socket.send_to(token, target).await.is_err() {
        return None;
    }

    let deadline = Instant::now() + window;
    let mut buf = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((_, from))) if is_from(target, from) => return Some(from),
            Ok(Ok(_)) => continue, // unrelated datagram; keep listening
            _ => return None,
        }
    }
}

/// Sprays `token` at `cadence` toward `target` while concurrently listening,
/// for up to `window`. Used by the enhanced-simultaneous-send strategy,
/// where both peers are racing to install NAT state at the same time.
async fn spray_and_listen(
    socket: &UdpSocket,
    target: SocketAddr,
    token: &[u8],
    cadence: Duration,
    window: Duration,
) -> Option<SocketAddr> {
    let deadline = Instant::now() + window;
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        let _ = socket.send_to(token, target).await;

        let remaining = deadline.saturating_duration_since(Instant::now()).min(cadence);
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((_, from))) if is_from(target, from) => return Some(from),
            _ => continue,
        }
    }
    None
}

/// Tries the LAN-direct strategy: a short handshake to the peer's private
/// endpoint, valid only when `lan::is_lan` holds.
async fn try_lan_direct(local: &NetworkInfo, remote: &NetworkInfo, role: &str) -> Option<HolePunchPath> {
    if !crate::lan::is_lan(local, remote) {
        return None;
    }

    let socket = to_tokio(bind_reusable(local.private_endpoint.port()).ok()?).ok()?;
    let token = magic_token(role);
    let confirmed = send_and_listen(&socket, remote.private_endpoint, &token, LAN_WINDOW).await?;

    Some(HolePunchPath {
        socket,
        confirmed_remote: confirmed,
        strategy: Strategy::LanDirect,
    })
}

/// Enhanced simultaneous send: both sides bind (ideally) the STUN-observed
/// port, the non-initiator waits briefly for coordination, then both spray
/// tokens at a 50ms cadence toward each other's public endpoint.
async fn try_enhanced_simultaneous(
    local: &NetworkInfo,
    remote: &NetworkInfo,
    is_initiator: bool,
    role: &str,
) -> Option<HolePunchPath> {
    let preferred_port = local
        .hole_punch_endpoint
        .map(|e| e.port())
        .unwrap_or_else(|| local.public_endpoint.port());

    let socket = to_tokio(bind_reusable(preferred_port).ok()?).ok()?;

    if !is_initiator {
        sleep(ENHANCED_COORDINATION_DELAY).await;
    }

    let token = magic_token(role);
    let confirmed = spray_and_listen(
        &socket,
        remote.public_endpoint,
        &token,
        ENHANCED_SEND_CADENCE,
        ENHANCED_WINDOW,
    )
    .await?;

    Some(HolePunchPath {
        socket,
        confirmed_remote: confirmed,
        strategy: Strategy::EnhancedSimultaneous,
    })
}

/// Direct public endpoint handshake: up to `DIRECT_RETRY_COUNT` attempts,
/// each with its own read window, sleeping `attempt * 500ms` between tries.
async fn try_direct_public(remote: &NetworkInfo, role: &str) -> Option<HolePunchPath> {
    let socket = to_tokio(bind_reusable(0).ok()?).ok()?;
    let token = magic_token(role);

    for attempt in 0..DIRECT_RETRY_COUNT {
        if attempt > 0 {
            sleep(DIRECT_RETRY_BASE_DELAY * attempt).await;
        }

        if let Some(confirmed) =
            send_and_listen(&socket, remote.public_endpoint, &token, DIRECT_READ_WINDOW).await
        {
            return Some(HolePunchPath {
                socket,
                confirmed_remote: confirmed,
                strategy: Strategy::DirectPublic,
            });
        }
    }
    None
}

/// Port prediction: probe `remotePort + delta` for a small neighborhood of
/// deltas, intended for mildly symmetric NATs. Not relied upon for strict
/// symmetric-to-symmetric pairings, which can't be punched at all.
async fn try_port_prediction(remote: &NetworkInfo, role: &str) -> Option<HolePunchPath> {
    let socket = to_tokio(bind_reusable(0).ok()?).ok()?;
    let token = magic_token(role);
    let base_port = remote.public_endpoint.port() as i32;

    for delta in PREDICTION_DELTAS {
        let candidate_port = base_port + delta;
        if !(1..=65535).contains(&candidate_port) {
            continue;
        }
        let target = SocketAddr::new(remote.public_endpoint.ip(), candidate_port as u16);

        if let Some(confirmed) =
            send_and_listen(&socket, target, &token, PREDICTION_WINDOW).await
        {
            return Some(HolePunchPath {
                socket,
                confirmed_remote: confirmed,
                strategy: Strategy::PortPrediction,
            });
        }
    }
    None
}

/// Runs every strategy in canonical order until one succeeds or `overall_timeout`
/// elapses.
pub async fn establish(
    local: &NetworkInfo,
    remote: &NetworkInfo,
    is_initiator: bool,
    overall_timeout: Duration,
) -> Result<HolePunchPath> {
    let role = if is_initiator { "initiator" } else { "responder" };
    let deadline = Instant::now() + overall_timeout;

    macro_rules! try_strategy {
        ($fut:expr) => {
            if Instant::now() >= deadline {
                return Err(Error::hole_punch("overall hole-punch timeout elapsed".into()));
            }
            let budget = deadline.saturating_duration_since(Instant::now());
            if let Ok(Some(path)) = timeout(budget, $fut).await {
                return Ok(path);
            }
        };
    }

    try_strategy!(try_lan_direct(local, remote, role));
    try_strategy!(try_enhanced_simultaneous(local, remote, is_initiator, role));
    try_strategy!(try_direct_public(remote, role));
    try_strategy!(try_port_prediction(remote, role));

    Err(Error::hole_punch(
        "all hole-punch strategies exhausted".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_token_embeds_role() {
        let t = magic_token("initiator");
        assert_eq!(t, b"ENHANCED_HOLE_PUNCH_initiator");
    }

    #[test]
    fn is_from_ignores_port_shift() {
        let expected: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let observed: SocketAddr = "203.0.113.9:5000".parse().unwrap();
        assert!(is_from(expected, observed));
    }

    #[test]
    fn is_from_rejects_different_ip() {
        let expected: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        let observed: SocketAddr = "198.51.100.1:4000".parse().unwrap();
        assert!(!is_from(expected, observed));
    }

    #[tokio::test]
    async fn direct_public_handshake_succeeds_between_two_local_sockets() {
        let responder = to_tokio(bind_reusable(0).unwrap()).unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let initiator = to_tokio(bind_reusable(0).unwrap()).unwrap();
        let initiator_addr = initiator.local_addr().unwrap();

        let initiator_token = magic_token("initiator");
        let responder_token = magic_token("responder");

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], initiator_token.as_slice());
            responder.send_to(&responder_token, from).await.unwrap();
        });

        let confirmed = send_and_listen(
            &initiator,
            responder_addr,
            &magic_token("initiator"),
            Duration::from_secs(2),
        )
        .await;

        echo.await.unwrap();
        assert_eq!(confirmed, Some(responder_addr));
        let _ = initiator_addr;
    }
}
