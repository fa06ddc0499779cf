//! Port Allocator: claims an ephemeral port from the OS for a given
//! protocol by binding port 0, reading back the assigned port, then dropping
//! the probe socket before the real listener opens on it.

use tokio::net::{TcpListener, UdpSocket};

use crate::error::{Error, Result};
use crate::mapping::Protocol;

/// Binds an ephemeral port for `protocol`, releases the probe socket, and
/// returns the assigned port number. Ports are never hard-coded; this
/// accepts a narrow race window between release and re-bind as acceptable.
pub async fn allocate(protocol: Protocol) -> Result<u16> {
    match protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind(("0.0.0.0", 0))
                .await
                .map_err(|e| Error::allocation(format!("TCP bind(0) failed: {e}")))?;
            listener
                .local_addr()
                .map(|a| a.port())
                .map_err(|e| Error::allocation(format!("cannot read assigned TCP port: {e}")))
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind(("0.0.0.0", 0))
                .await
                .map_err(|e| Error::allocation(format!("UDP bind(0) failed: {e}")))?;
            socket
                .local_addr()
                .map(|a| a.port())
                .map_err(|e| Error::allocation(format!("cannot read assigned UDP port: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_disjoint_ports() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            let port = allocate(Protocol::Tcp).await.unwrap();
            assert!(port > 0);
            assert!(seen.insert(port), "port {port} was allocated twice");
        }
    }

    #[tokio::test]
    async fn allocates_udp_ports_too() {
        let port = allocate(Protocol::Udp).await.unwrap();
        assert!(port > 0);
    }
}
