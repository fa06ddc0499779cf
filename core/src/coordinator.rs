//! Coordinator: sequences the NAT Probe, Signaling Client, Hole-Punch
//! Engine, Port Allocator, and Forwarding Plane into the Client and Server
//! role flows, and reconciles hot mapping changes on the Server side via
//! `MappingSet::diff`.
//!
//! Role split: the Client owns the user-facing `localPort` listener and
//! dials out to wherever the Server's allocation for that mapping lives
//! (LAN-direct, public, or hole-punched). The Server owns the allocated
//! public-facing port and always forwards to its own `127.0.0.1:remotePort`
//! service -- it never dials the Client directly except to complete a
//! hole-punch handshake.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{Config, Mode};
use crate::error::{Error, Result};
use crate::forward;
use crate::holepunch;
use crate::lan;
use crate::mapping::{
    ClientRegistration, MappingId, MappingSet, NatType, NetworkInfo, PortMapping, Protocol,
    ServerAllocation, ServerRegistration,
};
use crate::nat;
use crate::portalloc;
use crate::signaling::{Role, SignalingClient};

const CLIENT_REGISTRATION_REFRESH: Duration = Duration::from_secs(30);
const SERVER_REPUBLISH_INTERVAL: Duration = Duration::from_secs(30);
const FETCH_RETRY_ATTEMPTS: u32 = 5;
const FETCH_RETRY_DEADLINE: Duration = Duration::from_secs(2);
const HOLE_PUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The peer endpoint the Client dials for a mapping: the Server's private
/// endpoint when on the same LAN, its public endpoint otherwise.
fn peer_target(is_lan: bool, server: &NetworkInfo, allocated_port: u16) -> SocketAddr {
    let ip: IpAddr = if is_lan {
        server.private_endpoint.ip()
    } else {
        server.public_endpoint.ip()
    };
    SocketAddr::new(ip, allocated_port)
}

/// Whether this pair can just relay over a direct dial -- same LAN, or the
/// Server's own NAT is easy enough that the Client can reach it without a
/// punched path. Both sides compute this identically since the inputs
/// (LAN membership, the Server's NAT class) don't depend on which side asks.
fn use_relay(client_info: &NetworkInfo, server_info: &NetworkInfo) -> bool {
    lan::is_lan(client_info, server_info) || matches!(server_info.nat_type, NatType::None | NatType::FullCone)
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// One mapping's live forwarder on the Server: its cancellation handle, join
/// handle (`None` if no path could be established), and the allocation it
/// was published under.
struct ActiveServerMapping {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
    allocation: ServerAllocation,
}

/// One mapping's live forwarder on the Client.
struct ActiveClientMapping {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

pub struct Coordinator {
    config: Config,
    signaling: SignalingClient,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let signaling = SignalingClient::new(config.signaling_url.clone());
        Self { config, signaling }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        match self.config.mode {
            Mode::Client => self.run_client(cancel).await,
            Mode::Server => self.run_server(cancel).await,
        }
    }

    async fn run_client(&self, cancel: CancellationToken) -> Result<()> {
        let client_info = nat::probe(&self.config.stun_server, Some(&self.config.secondary_stun_server))
            .await?;
        tracing::info!(
            nat_type = ?client_info.nat_type,
            public = %client_info.public_endpoint,
            "client: NAT probe complete"
        );

        let registration = ClientRegistration {
            network_info: client_info.clone(),
            mappings: self.config.mappings.to_strings(),
        };
        let payload = serde_json::to_string(&registration)?;

        self.signaling
            .publish(Role::Client, &self.config.room_id, &payload)
            .await?;
        tracing::info!(
            room = %self.config.room_id,
            mappings = registration.mappings.len(),
            "client: registration published"
        );

        // Primes the room's mappingVersion counter so a later call to
        // `republish_mappings` (a hot mapping change) is observable by the
        // Server's `checkUpdates` watch from a known baseline.
        if let Err(e) = self
            .signaling
            .update_mappings(&self.config.room_id, &registration.mappings)
            .await
        {
            tracing::warn!(error = %e, "client: initial mapping version priming failed");
        }

        let server_registration = self.fetch_server_registration().await?;
        tracing::info!(
            allocations = server_registration.allocations.len(),
            "client: server registration received"
        );

        let mut forwarders = self
            .start_client_mappings(
                &client_info,
                &server_registration.network_info,
                &self.config.mappings,
                &server_registration.allocations,
                &cancel,
            )
            .await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    for (_, fwd) in forwarders.drain() {
                        fwd.cancel.cancel();
                        if let Some(handle) = fwd.handle {
                            let _ = handle.await;
                        }
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(CLIENT_REGISTRATION_REFRESH) => {
                    if let Err(e) = self.signaling.publish(Role::Client, &self.config.room_id, &payload).await {
                        tracing::warn!(error = %e, "client: registration refresh failed, will retry");
                    }
                }
            }
        }
    }

    /// Publishes a new mapping set for the current room, bumping the room's
    /// mappingVersion so the Server's watch loop picks it up within one tick
    /// of `watchIntervalSecs`. The hook a future config-reload (SIGHUP, file
    /// watch) would call to drive a hot add/remove.
    pub async fn republish_mappings(&self, mappings: &[String]) -> Result<()> {
        self.signaling
            .update_mappings(&self.config.room_id, mappings)
            .await
    }

    async fn fetch_server_registration(&self) -> Result<ServerRegistration> {
        for attempt in 0..FETCH_RETRY_ATTEMPTS {
            match self
                .signaling
                .fetch(&self.config.room_id, Role::Server, FETCH_RETRY_DEADLINE)
                .await
            {
                Ok(raw) => match serde_json::from_str::<ServerRegistration>(&raw) {
                    Ok(reg) => return Ok(reg),
                    Err(e) => tracing::warn!(attempt, error = %e, "server registration payload malformed, retrying"),
                },
                Err(e) => tracing::warn!(attempt, error = %e, "server registration fetch failed, retrying"),
            }
        }
        Err(Error::signaling("server registration never became available"))
    }

    async fn fetch_client_registration(&self) -> Result<ClientRegistration> {
        for attempt in 0..FETCH_RETRY_ATTEMPTS {
            match self
                .signaling
                .fetch(&self.config.room_id, Role::Client, FETCH_RETRY_DEADLINE)
                .await
            {
                Ok(raw) => match serde_json::from_str::<ClientRegistration>(&raw) {
                    Ok(reg) => return Ok(reg),
                    Err(e) => tracing::warn!(attempt, error = %e, "client registration payload malformed, retrying"),
                },
                Err(e) => tracing::warn!(attempt, error = %e, "client registration fetch failed, retrying"),
            }
        }
        Err(Error::signaling("client registration never became available"))
    }

    /// Starts one mapping's forwarder on the Client: listens on the user's
    /// `localPort` and dials out to wherever the Server's allocation for
    /// this mapping is reachable -- LAN-direct, public, or hole-punched.
    async fn start_client_mapping(
        &self,
        client_info: &NetworkInfo,
        server_info: &NetworkInfo,
        mapping: PortMapping,
        allocated_port: u16,
        parent_cancel: &CancellationToken,
    ) -> ActiveClientMapping {
        let child_cancel = parent_cancel.child_token();
        let is_lan = lan::is_lan(client_info, server_info);

        let handle = match mapping.protocol {
            Protocol::Tcp => {
                let target = peer_target(is_lan, server_info, allocated_port);
                let local_port = mapping.local_port;
                let c = child_cancel.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = forward::run_tcp_forward(local_port, target, c).await {
                        tracing::warn!(error = %e, "tcp mapping forwarder exited with error");
                    }
                }))
            }
            Protocol::Udp => {
                if use_relay(client_info, server_info) {
                    let target = peer_target(is_lan, server_info, allocated_port);
                    let session_timeout = Duration::from_secs(self.config.session_timeout_secs);
                    let local_port = mapping.local_port;
                    let c = child_cancel.clone();
                    Some(tokio::spawn(async move {
                        if let Err(e) =
                            forward::run_udp_relay(local_port, target, session_timeout, c).await
                        {
                            tracing::warn!(error = %e, "udp relay mapping forwarder exited with error");
                        }
                    }))
                } else if client_info.can_hole_punch && server_info.can_hole_punch {
                    match holepunch::establish(client_info, server_info, true, HOLE_PUNCH_TIMEOUT).await {
                        Ok(path) => {
                            let local_port = mapping.local_port;
                            let c = child_cancel.clone();
                            Some(tokio::spawn(async move {
                                if let Err(e) = forward::run_udp_punched(local_port, path, c).await {
                                    tracing::warn!(error = %e, "udp hole-punched mapping forwarder exited with error");
                                }
                            }))
                        }
                        Err(e) => {
                            tracing::warn!(%mapping, error = %e, "hole punch failed, mapping left unreachable");
                            None
                        }
                    }
                } else {
                    tracing::warn!(
                        %mapping,
                        "server NAT is symmetric and not reachable via LAN; mapping cannot be forwarded"
                    );
                    None
                }
            }
        };

        ActiveClientMapping {
            cancel: child_cancel,
            handle,
        }
    }

    /// Starts every configured mapping that the Server has an allocation
    /// for, matching by `PortMapping` identity. A mapping with no matching
    /// allocation yet is skipped with a warning rather than blocking startup
    /// on the rest.
    async fn start_client_mappings(
        &self,
        client_info: &NetworkInfo,
        server_info: &NetworkInfo,
        mappings: &MappingSet,
        allocations: &[ServerAllocation],
        parent_cancel: &CancellationToken,
    ) -> HashMap<MappingId, ActiveClientMapping> {
        let mut forwarders = HashMap::new();

        for mapping in mappings.iter() {
            let found = allocations.iter().find(|a| {
                PortMapping::parse(&a.client_mapping)
                    .map(|m| m.id() == mapping.id())
                    .unwrap_or(false)
            });

            let Some(allocation) = found else {
                tracing::warn!(%mapping, "no server allocation yet for this mapping, skipping");
                continue;
            };

            let active = self
                .start_client_mapping(client_info, server_info, *mapping, allocation.allocated_port, parent_cancel)
                .await;
            forwarders.insert(mapping.id(), active);
        }

        forwarders
    }

    /// Starts one mapping's forwarder on the Server: allocates its public
    /// port, then forwards to the Server's own `127.0.0.1:remotePort`
    /// service directly, or (for UDP, when a direct path isn't available)
    /// bridges a hole-punched path to that same local service.
    async fn start_server_mapping(
        &self,
        client_info: &NetworkInfo,
        server_info: &NetworkInfo,
        mapping: &PortMapping,
        parent_cancel: &CancellationToken,
    ) -> Result<ActiveServerMapping> {
        let allocated_port = portalloc::allocate(mapping.protocol).await?;
        let child_cancel = parent_cancel.child_token();
        let upstream = localhost(mapping.remote_port);

        let handle = match mapping.protocol {
            Protocol::Tcp => {
                let c = child_cancel.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = forward::run_tcp_forward(allocated_port, upstream, c).await {
                        tracing::warn!(error = %e, "tcp mapping forwarder exited with error");
                    }
                }))
            }
            Protocol::Udp => {
                if use_relay(client_info, server_info) {
                    let session_timeout = Duration::from_secs(self.config.session_timeout_secs);
                    let c = child_cancel.clone();
                    Some(tokio::spawn(async move {
                        if let Err(e) =
                            forward::run_udp_relay(allocated_port, upstream, session_timeout, c).await
                        {
                            tracing::warn!(error = %e, "udp relay mapping forwarder exited with error");
                        }
                    }))
                } else if server_info.can_hole_punch && client_info.can_hole_punch {
                    match holepunch::establish(server_info, client_info, false, HOLE_PUNCH_TIMEOUT).await {
                        Ok(path) => {
                            let c = child_cancel.clone();
                            Some(tokio::spawn(async move {
                                if let Err(e) = forward::run_udp_bridge_punched(path, upstream, c).await {
                                    tracing::warn!(error = %e, "udp hole-punched mapping forwarder exited with error");
                                }
                            }))
                        }
                        Err(e) => {
                            tracing::warn!(%mapping, error = %e, "hole punch failed, mapping left unreachable");
                            None
                        }
                    }
                } else {
                    tracing::warn!(
                        %mapping,
                        "client NAT is symmetric and not reachable via LAN; mapping cannot be forwarded"
                    );
                    None
                }
            }
        };

        Ok(ActiveServerMapping {
            cancel: child_cancel,
            handle,
            allocation: ServerAllocation {
                client_mapping: mapping.to_string(),
                allocated_port,
            },
        })
    }

    async fn start_server_mappings(
        &self,
        client_info: &NetworkInfo,
        server_info: &NetworkInfo,
        mappings: &MappingSet,
        parent_cancel: &CancellationToken,
    ) -> Result<(Vec<ServerAllocation>, HashMap<MappingId, ActiveServerMapping>)> {
        let mut forwarders = HashMap::new();
        let mut allocations = Vec::new();

        for mapping in mappings.iter() {
            let active = self
                .start_server_mapping(client_info, server_info, mapping, parent_cancel)
                .await?;
            allocations.push(active.allocation.clone());
            forwarders.insert(mapping.id(), active);
        }

        Ok((allocations, forwarders))
    }

    /// Tears down forwarders for mappings removed from `new` relative to
    /// `old`, and starts fresh ones for mappings added. Returns the
    /// resulting full allocation list to republish.
    async fn reconcile(
        &self,
        client_info: &NetworkInfo,
        server_info: &NetworkInfo,
        old: &MappingSet,
        new: &MappingSet,
        forwarders: &mut HashMap<MappingId, ActiveServerMapping>,
        parent_cancel: &CancellationToken,
    ) -> Vec<ServerAllocation> {
        let (added, removed) = new.diff(old);

        for id in removed {
            if let Some(active) = forwarders.remove(&id) {
                active.cancel.cancel();
                if let Some(handle) = active.handle {
                    let _ = handle.await;
                }
                tracing::info!(?id, "mapping removed, forwarder torn down");
            }
        }

        for mapping in added {
            match self
                .start_server_mapping(client_info, server_info, &mapping, parent_cancel)
                .await
            {
                Ok(active) => {
                    tracing::info!(%mapping, "mapping added, forwarder started");
                    forwarders.insert(mapping.id(), active);
                }
                Err(e) => {
                    tracing::warn!(%mapping, error = %e, "failed to start forwarder for added mapping");
                }
            }
        }

        forwarders.values().map(|a| a.allocation.clone()).collect()
    }

    async fn run_server(&self, cancel: CancellationToken) -> Result<()> {
        let server_info = nat::probe(&self.config.stun_server, Some(&self.config.secondary_stun_server))
            .await?;
        tracing::info!(
            nat_type = ?server_info.nat_type,
            public = %server_info.public_endpoint,
            "server: NAT probe complete"
        );

        let client_registration = self.fetch_client_registration().await?;
        let mut active_mappings = MappingSet::parse_lenient(&client_registration.mappings);
        let mut client_info = client_registration.network_info.clone();

        let (allocations, mut forwarders) = self
            .start_server_mappings(&client_info, &server_info, &active_mappings, &cancel)
            .await?;

        let mut registration = ServerRegistration {
            network_info: server_info.clone(),
            allocations,
        };
        let mut payload = serde_json::to_string(&registration)?;

        self.signaling
            .publish(Role::Server, &self.config.room_id, &payload)
            .await?;
        tracing::info!(
            room = %self.config.room_id,
            mappings = active_mappings.len(),
            "server: registration published"
        );

        let mut republish_tick = tokio::time::interval(SERVER_REPUBLISH_INTERVAL);
        let watch_interval = Duration::from_secs(self.config.watch_interval_secs.max(1));
        let mut last_mapping_version: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    for (_, mapping) in forwarders.drain() {
                        mapping.cancel.cancel();
                        if let Some(handle) = mapping.handle {
                            let _ = handle.await;
                        }
                    }
                    return Ok(());
                }
                _ = republish_tick.tick() => {
                    if let Err(e) = self.signaling.publish(Role::Server, &self.config.room_id, &payload).await {
                        tracing::warn!(error = %e, "server: republish failed, will retry next tick");
                    }
                }
                result = self.signaling.check_updates(&self.config.room_id, last_mapping_version) => {
                    match result {
                        Ok((true, Some(raw))) => {
                            last_mapping_version += 1;
                            match serde_json::from_str::<ClientRegistration>(&raw) {
                                Ok(updated) => {
                                    let new_set = MappingSet::parse_lenient(&updated.mappings);
                                    client_info = updated.network_info;
                                    let allocations = self
                                        .reconcile(&client_info, &server_info, &active_mappings, &new_set, &mut forwarders, &cancel)
                                        .await;
                                    active_mappings = new_set;
                                    registration = ServerRegistration {
                                        network_info: server_info.clone(),
                                        allocations,
                                    };
                                    payload = serde_json::to_string(&registration)?;
                                    if let Err(e) = self.signaling.publish(Role::Server, &self.config.room_id, &payload).await {
                                        tracing::warn!(error = %e, "server: post-reconcile republish failed");
                                    }
                                }
                                Err(e) => tracing::warn!(error = %e, "server: updated client registration malformed, ignoring"),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "server: checkUpdates failed, will retry"),
                    }
                    tokio::time::sleep(watch_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Mode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

    fn dummy_network_info(port: u16) -> NetworkInfo {
        // Same public IP on both sides keeps `use_relay` true so the test
        // exercises the TCP direct-forward path without a hole punch.
        NetworkInfo {
            private_endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            public_endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            nat_type: NatType::FullCone,
            hole_punch_endpoint: None,
            can_hole_punch: true,
        }
    }

    fn test_config() -> Config {
        Config {
            mode: Mode::Server,
            room_id: "reconcile-test".to_string(),
            signaling_url: "http://127.0.0.1:0".to_string(),
            stun_server: "stun.l.google.com:19302".to_string(),
            secondary_stun_server: "stun1.l.google.com:19302".to_string(),
            session_timeout_secs: 60,
            watch_interval_secs: 2,
            mappings: MappingSet::new(),
            log_level: "info".to_string(),
        }
    }

    /// Spawns a one-shot TCP echo-style upstream: accepts a single connection,
    /// writes `reply` and returns.
    async fn spawn_tagged_upstream(reply: &'static [u8]) -> u16 {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(reply).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn reconcile_tears_down_removed_and_starts_added_mappings() {
        let coordinator = Coordinator::new(test_config());
        let client_info = dummy_network_info(31000);
        let server_info = dummy_network_info(31000);
        let cancel = CancellationToken::new();

        let upstream_a = spawn_tagged_upstream(b"A").await;
        let old_set =
            MappingSet::parse_strict(&[format!("tcp:9001:{upstream_a}")]).unwrap();

        let (allocations, mut forwarders) = coordinator
            .start_server_mappings(&client_info, &server_info, &old_set, &cancel)
            .await
            .unwrap();
        assert_eq!(allocations.len(), 1);
        let old_allocated_port = allocations[0].allocated_port;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut conn = TcpStream::connect(("127.0.0.1", old_allocated_port))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"A");
        drop(conn);

        let upstream_b = spawn_tagged_upstream(b"B").await;
        let new_set =
            MappingSet::parse_strict(&[format!("tcp:9002:{upstream_b}")]).unwrap();

        let new_allocations = coordinator
            .reconcile(&client_info, &server_info, &old_set, &new_set, &mut forwarders, &cancel)
            .await;
        assert_eq!(new_allocations.len(), 1);
        let new_allocated_port = new_allocations[0].allocated_port;
        assert_ne!(new_allocated_port, old_allocated_port);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(TcpStream::connect(("127.0.0.1", old_allocated_port)).await.is_err());

        let mut conn = TcpStream::connect(("127.0.0.1", new_allocated_port))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"B");

        cancel.cancel();
        for (_, fwd) in forwarders.drain() {
            if let Some(handle) = fwd.handle {
                let _ = handle.await;
            }
        }
    }
}
