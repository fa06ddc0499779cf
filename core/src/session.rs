//! Session Manager: per-source UDP forwarding state with idle eviction.
//!
//! Keyed by source endpoint. A reader-writer lock guards the table; writers
//! do insert/delete/activity-update, and the lock is never held across a
//! socket read/write.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// One UDP session: the peer's upstream-connected socket and its last
/// observed activity time.
pub struct UdpSession {
    pub upstream: Arc<UdpSocket>,
    last_activity: RwLock<Instant>,
    reader_claimed: AtomicBool,
}

impl UdpSession {
    pub(crate) async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub(crate) async fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.read().await.elapsed() > timeout
    }

    /// Claims responsibility for this session's upstream-to-local reader
    /// task. Returns `true` exactly once per session, so the Forwarding
    /// Plane can spawn a single reader regardless of how many concurrent
    /// `get_or_create` calls raced to create it.
    pub fn claim_reader(&self) -> bool {
        self.reader_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Per-listener table of sessions keyed by source endpoint.
pub struct SessionManager {
    sessions: RwLock<HashMap<SocketAddr, Arc<UdpSession>>>,
    session_timeout: Duration,
}

impl SessionManager {
    pub fn new(session_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            session_timeout,
        })
    }

    /// Returns the existing session for `source` (bumping its activity), or
    /// dials a fresh upstream-connected socket to `upstream_target` and
    /// inserts a new one. At most one session per source endpoint exists at
    /// any instant.
    pub async fn get_or_create(
        &self,
        source: SocketAddr,
        upstream_target: SocketAddr,
    ) -> Result<Arc<UdpSession>> {
        if let Some(existing) = self.sessions.read().await.get(&source) {
            existing.touch().await;
            return Ok(existing.clone());
        }

        let mut sessions = self.sessions.write().await;
        // Re-check under the write lock: another task may have created it
        // between the read-lock release above and acquiring this one.
        if let Some(existing) = sessions.get(&source) {
            existing.touch().await;
            return Ok(existing.clone());
        }

        let bind_addr: SocketAddr = if upstream_target.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::forwarding(format!("cannot bind upstream socket: {e}")))?;
        socket
            .connect(upstream_target)
            .await
            .map_err(|e| Error::forwarding(format!("cannot connect upstream socket: {e}")))?;

        let session = Arc::new(UdpSession {
            upstream: Arc::new(socket),
            last_activity: RwLock::new(Instant::now()),
            reader_claimed: AtomicBool::new(false),
        });
        sessions.insert(source, session.clone());
        Ok(session)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Evicts every session idle for longer than `session_timeout`, closing
    /// its upstream socket before removing the entry (the socket is simply
    /// dropped; there is no separate close step for a UDP socket).
    pub async fn sweep_once(&self) {
        let mut sessions = self.sessions.write().await;
        let timeout = self.session_timeout;
        let mut to_remove = Vec::new();
        for (addr, session) in sessions.iter() {
            if session.is_idle(timeout).await {
                to_remove.push(*addr);
            }
        }
        for addr in to_remove {
            sessions.remove(&addr);
        }
    }

    /// Runs the 60 s sweeper tick until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => self.sweep_once().await,
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_source() {
        let mgr = SessionManager::new(Duration::from_secs(300));
        let upstream = addr("127.0.0.1:7"); // stub target, no traffic sent here

        let a = mgr
            .get_or_create(addr("10.0.0.1:1111"), upstream)
            .await
            .unwrap();
        let b = mgr
            .get_or_create(addr("10.0.0.1:1111"), upstream)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_sources_get_distinct_sessions() {
        let mgr = SessionManager::new(Duration::from_secs(300));
        let upstream = addr("127.0.0.1:7");

        mgr.get_or_create(addr("10.0.0.1:1111"), upstream)
            .await
            .unwrap();
        mgr.get_or_create(addr("10.0.0.2:2222"), upstream)
            .await
            .unwrap();

        assert_eq!(mgr.len().await, 2);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let upstream = addr("127.0.0.1:7");

        mgr.get_or_create(addr("10.0.0.1:1111"), upstream)
            .await
            .unwrap();
        assert_eq!(mgr.len().await, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        mgr.sweep_once().await;

        assert_eq!(mgr.len().await, 0);
    }

    #[tokio::test]
    async fn active_session_survives_sweep() {
        let mgr = SessionManager::new(Duration::from_millis(200));
        let upstream = addr("127.0.0.1:7");

        mgr.get_or_create(addr("10.0.0.1:1111"), upstream)
            .await
            .unwrap();
        mgr.sweep_once().await;
        assert_eq!(mgr.len().await, 1);
    }
}
