//! NAT Probe: STUN binding requests (RFC 5389-style XOR-MAPPED-ADDRESS)
//! used to discover the public endpoint and classify NAT behavior.
//!
//! The wire format follows the same minimal binding-request/response shape
//! this codebase's predecessor NAT module used (magic cookie + 12-byte
//! transaction id, scan attributes for XOR-MAPPED-ADDRESS), generalized here
//! to a fuller classification algorithm: a second binding from the same
//! local endpoint to detect `Symmetric`, and an optional secondary server to
//! distinguish `FullCone` from `RestrictedCone`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::RngCore;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::mapping::{NatType, NetworkInfo};

const MAGIC_COOKIE: u32 = 0x2112_A442;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const STUN_TIMEOUT: Duration = Duration::from_secs(2);
const CACHE_TTL: Duration = Duration::from_secs(300);

fn build_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut msg = [0u8; 20];
    msg[0..2].copy_from_slice(&0x0001u16.to_be_bytes()); // Binding Request
    msg[2..4].copy_from_slice(&0u16.to_be_bytes()); // length = 0, no attributes
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction_id);
    msg
}

fn random_transaction_id() -> [u8; 12] {
    let mut tx = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut tx);
    tx
}

/// Parses a STUN binding response, returning the XOR-MAPPED-ADDRESS attribute.
fn parse_xor_mapped_address(buf: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if buf.len() < 20 {
        return Err(Error::Probe("STUN response too short".into()));
    }
    if buf[4..8] != MAGIC_COOKIE.to_be_bytes() {
        return Err(Error::Probe("STUN response: bad magic cookie".into()));
    }
    if buf[8..20] != transaction_id[..] {
        return Err(Error::Probe("STUN response: transaction id mismatch".into()));
    }

    let declared_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let end = (20 + declared_len).min(buf.len());

    let mut i = 20;
    while i + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[i], buf[i + 1]]);
        let attr_len = u16::from_be_bytes([buf[i + 2], buf[i + 3]]) as usize;
        let value_start = i + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }

        if attr_type == XOR_MAPPED_ADDRESS && attr_len >= 8 {
            let family = buf[value_start + 1];
            let xor_port = u16::from_be_bytes([buf[value_start + 2], buf[value_start + 3]]);
            let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;

            let addr = match family {
                0x01 => {
                    let mut octets = [0u8; 4];
                    for (k, octet) in octets.iter_mut().enumerate() {
                        *octet = buf[value_start + 4 + k] ^ buf[4 + k];
                    }
                    IpAddr::V4(Ipv4Addr::from(octets))
                }
                0x02 if attr_len >= 20 => {
                    let mut octets = [0u8; 16];
                    let xor_key: Vec<u8> = buf[4..20].to_vec();
                    for (k, octet) in octets.iter_mut().enumerate() {
                        *octet = buf[value_start + 4 + k] ^ xor_key[k];
                    }
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                _ => return Err(Error::Probe("unsupported address family".into())),
            };

            return Ok(SocketAddr::new(addr, port));
        }

        // attributes are padded to 4-byte boundaries
        i = value_end + ((4 - (attr_len % 4)) % 4);
    }

    Err(Error::Probe("no XOR-MAPPED-ADDRESS in STUN response".into()))
}

/// Sends one binding request over `sock` to `server` and awaits the response.
async fn stun_binding(sock: &UdpSocket, server: SocketAddr) -> Result<SocketAddr> {
    let tx = random_transaction_id();
    let request = build_binding_request(&tx);

    sock.send_to(&request, server)
        .await
        .map_err(|e| Error::Probe(format!("STUN send failed: {e}")))?;

    let mut buf = [0u8; 512];
    let (n, _from) = timeout(STUN_TIMEOUT, sock.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Probe("STUN request timed out".into()))?
        .map_err(|e| Error::Probe(format!("STUN recv failed: {e}")))?;

    parse_xor_mapped_address(&buf[..n], &tx)
}

/// Binds a dual-stack-unconstrained IPv6 socket with `IPV6_V6ONLY` disabled,
/// the last resort when both a plain `udp4` and a plain `udp6` bind fail.
fn bind_unconstrained(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
    let _ = socket.set_only_v6(false);
    let addr: SocketAddr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Binds a UDP socket for probing, trying `udp4` first, then `udp6`, then an
/// unconstrained dual-stack socket -- so a v6-only or oddly configured host
/// still gets a working probe socket.
fn bind_dual_stack(port: u16) -> Result<std::net::UdpSocket> {
    let sock = std::net::UdpSocket::bind(("0.0.0.0", port))
        .or_else(|_| std::net::UdpSocket::bind(("[::]", port)))
        .or_else(|_| bind_unconstrained(port))
        .map_err(|e| Error::Probe(format!("cannot bind probe socket on any stack: {e}")))?;
    sock.set_nonblocking(true)
        .map_err(|e| Error::Probe(format!("set_nonblocking failed: {e}")))?;
    Ok(sock)
}

fn bind_dual_stack_tokio(port: u16) -> Result<UdpSocket> {
    UdpSocket::from_std(bind_dual_stack(port)?)
        .map_err(|e| Error::Probe(format!("socket setup failed: {e}")))
}

async fn resolve_stun_server(spec: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(spec)
        .await
        .map_err(|e| Error::Probe(format!("cannot resolve STUN server {spec}: {e}")))?
        .next()
        .ok_or_else(|| Error::Probe(format!("no address found for {spec}")))
}

/// Discovers the private (local) endpoint by connecting a UDP socket to a
/// public anchor and reading the kernel-assigned local address. Never sends
/// a packet (UDP `connect` is purely local route-table resolution).
async fn discover_private_endpoint(bind_port: u16) -> Result<SocketAddr> {
    let sock = bind_dual_stack_tokio(bind_port)?;
    sock.connect("8.8.8.8:80").await?;
    Ok(sock.local_addr()?)
}

fn classify(
    private: SocketAddr,
    first: SocketAddr,
    second: SocketAddr,
    secondary_result: Option<SocketAddr>,
) -> (NatType, bool) {
    if private.ip() == first.ip() {
        return (NatType::None, true);
    }

    if first != second {
        return (NatType::Symmetric, false);
    }

    match secondary_result {
        Some(addr) if addr.port() == first.port() => (NatType::FullCone, true),
        Some(_) => (NatType::RestrictedCone, true),
        None => (NatType::RestrictedCone, true),
    }
}

/// Result of a NAT probe, with the TTL-cached entry timestamp.
#[derive(Clone)]
struct CacheEntry {
    info: NetworkInfo,
    at: Instant,
}

/// Process-wide STUN result cache. A `RwLock`-guarded `Option` rather than a
/// keyed map, since one process probes on behalf of one local identity.
static STUN_CACHE: RwLock<Option<CacheEntry>> = RwLock::const_new(None);

/// Clears the process-wide STUN cache, so the next `probe()` call re-runs
/// the full algorithm instead of returning a stale cached entry. Exposed for
/// tests, since the cache is otherwise process-wide mutable state.
pub async fn clear() {
    *STUN_CACHE.write().await = None;
}

/// Runs the full NAT Probe algorithm, or returns the cached result if still
/// within `CACHE_TTL`.
pub async fn probe(primary_stun: &str, secondary_stun: Option<&str>) -> Result<NetworkInfo> {
    if let Some(entry) = STUN_CACHE.read().await.as_ref() {
        if entry.at.elapsed() < CACHE_TTL {
            return Ok(entry.info.clone());
        }
    }

    let info = probe_uncached(primary_stun, secondary_stun).await?;

    *STUN_CACHE.write().await = Some(CacheEntry {
        info: info.clone(),
        at: Instant::now(),
    });

    Ok(info)
}

async fn probe_uncached(primary_stun: &str, secondary_stun: Option<&str>) -> Result<NetworkInfo> {
    let private = discover_private_endpoint(0).await?;

    let server = resolve_stun_server(primary_stun).await;
    let server = match server {
        Ok(s) => s,
        Err(e) => return Err(e),
    };

    let sock = bind_dual_stack_tokio(0)?;

    let first = match stun_binding(&sock, server).await {
        Ok(addr) => addr,
        Err(_) => {
            // Total probe failure is fatal to startup; a half-learned result
            // (none at all here) has nothing to degrade to, so this remains
            // an error.
            return Err(Error::Probe(
                "primary STUN binding failed; cannot determine public endpoint".into(),
            ));
        }
    };

    // Second binding from the *same* local socket, to detect symmetric NATs.
    let second = match stun_binding(&sock, server).await {
        Ok(addr) => addr,
        Err(_) => {
            // Degrade gracefully: we still learned `first`, so report an
            // optimistic, punchable Unknown classification rather than
            // failing the whole probe.
            return Ok(NetworkInfo {
                private_endpoint: private,
                public_endpoint: first,
                nat_type: NatType::Unknown,
                hole_punch_endpoint: None,
                can_hole_punch: true,
            });
        }
    };

    let secondary_result = match secondary_stun {
        Some(spec) => match resolve_stun_server(spec).await {
            Ok(addr) => stun_binding(&sock, addr).await.ok(),
            Err(_) => None,
        },
        None => None,
    };

    let (nat_type, can_hole_punch) = classify(private, first, second, secondary_result);

    Ok(NetworkInfo {
        private_endpoint: private,
        public_endpoint: first,
        nat_type,
        hole_punch_endpoint: None,
        can_hole_punch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> SocketAddr {
        format!("{ip}:{port}").parse().unwrap()
    }

    #[test]
    fn classification_is_not_symmetric_when_reflections_match() {
        let private = addr("192.168.1.10", 4000);
        let first = addr("203.0.113.9", 55000);
        let second = addr("203.0.113.9", 55000);
        let (nat, can_punch) = classify(private, first, second, None);
        assert_ne!(nat, NatType::Symmetric);
        assert!(can_punch);
    }

    #[test]
    fn classification_is_symmetric_when_reflections_differ() {
        let private = addr("192.168.1.10", 4000);
        let first = addr("203.0.113.9", 55000);
        let second = addr("203.0.113.9", 55001);
        let (nat, can_punch) = classify(private, first, second, None);
        assert_eq!(nat, NatType::Symmetric);
        assert!(!can_punch);
    }

    #[test]
    fn classification_detects_full_cone_via_secondary_server() {
        let private = addr("192.168.1.10", 4000);
        let first = addr("203.0.113.9", 55000);
        let second = addr("203.0.113.9", 55000);
        let secondary = addr("198.51.100.1", 55000);
        let (nat, _) = classify(private, first, second, Some(secondary));
        assert_eq!(nat, NatType::FullCone);
    }

    #[test]
    fn classification_detects_restricted_cone_when_port_differs_on_secondary() {
        let private = addr("192.168.1.10", 4000);
        let first = addr("203.0.113.9", 55000);
        let second = addr("203.0.113.9", 55000);
        let secondary = addr("198.51.100.1", 60000);
        let (nat, _) = classify(private, first, second, Some(secondary));
        assert_eq!(nat, NatType::RestrictedCone);
    }

    #[test]
    fn classification_is_none_when_public_equals_private() {
        let private = addr("203.0.113.9", 4000);
        let first = addr("203.0.113.9", 55000);
        let second = first;
        let (nat, can_punch) = classify(private, first, second, None);
        assert_eq!(nat, NatType::None);
        assert!(can_punch);
    }

    #[test]
    fn xor_mapped_address_round_trip() {
        let tx = random_transaction_id();
        // Build a synthetic response by XOR-encoding 203.0.113.9:55000.
        let mut resp = vec![0u8; 32];
        resp[0..2].copy_from_slice(&0x0101u16.to_be_bytes());
        resp[2..4].copy_from_slice(&12u16.to_be_bytes());
        resp[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp[8..20].copy_from_slice(&tx);
        resp[20..22].copy_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        resp[22..24].copy_from_slice(&8u16.to_be_bytes());
        resp[24] = 0;
        resp[25] = 0x01;
        let port = 55000u16 ^ (MAGIC_COOKIE >> 16) as u16;
        resp[26..28].copy_from_slice(&port.to_be_bytes());
        let ip = Ipv4Addr::new(203, 0, 113, 9).octets();
        for k in 0..4 {
            resp[28 + k] = ip[k] ^ resp[4 + k];
        }

        let parsed = parse_xor_mapped_address(&resp, &tx).unwrap();
        assert_eq!(parsed, addr("203.0.113.9", 55000));
    }
}
