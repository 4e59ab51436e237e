//! Endpoint discovery: static single-node or cluster gossip.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::{
    errors::Error,
    settings::{ClusterSettings, NodeAddress},
    types::NodeEndpoints,
};

/// Resolves the endpoints of the node to connect to next.
///
/// A terminal `Err` makes the engine close the connection; transient
/// failures are retried by the engine through its normal reconnection
/// schedule, so implementations should not loop forever themselves.
#[async_trait]
pub trait Discover: Send + Sync {
    /// `failed` is the endpoint the engine last lost, when there was one;
    /// implementations should prefer a different node if they can.
    async fn discover(&self, failed: Option<SocketAddr>) -> Result<NodeEndpoints, Error>;
}

/// Always returns the preconfigured node, re-resolving DNS on every call.
pub struct StaticDiscoverer {
    node: NodeAddress,
}

impl StaticDiscoverer {
    pub fn new(node: NodeAddress) -> Self {
        Self { node }
    }

    async fn resolve(&self, port: u16) -> Result<SocketAddr, Error> {
        lookup_host((self.node.host.as_str(), port))
            .await
            .map_err(|e| {
                Error::CannotEstablishConnection(format!(
                    "failed to resolve '{}': {e}",
                    self.node.host
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::CannotEstablishConnection(format!(
                    "'{}' resolved to no addresses",
                    self.node.host
                ))
            })
    }
}

#[async_trait]
impl Discover for StaticDiscoverer {
    async fn discover(&self, _failed: Option<SocketAddr>) -> Result<NodeEndpoints, Error> {
        let tcp = self.resolve(self.node.port).await?;
        let secure_tcp = match self.node.secure_port {
            Some(port) => Some(self.resolve(port).await?),
            None => None,
        };
        Ok(NodeEndpoints { hostname: self.node.host.clone(), tcp: Some(tcp), secure_tcp })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MemberInfo {
    state: String,
    is_alive: bool,
    external_tcp_ip: String,
    external_tcp_port: u16,
    #[serde(default)]
    external_secure_tcp_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct GossipResponse {
    members: Vec<MemberInfo>,
}

/// Preference order among member states; `None` excludes the member.
fn state_rank(state: &str) -> Option<u8> {
    match state {
        "Master" => Some(0),
        "PreMaster" => Some(1),
        "Slave" => Some(2),
        "Clone" => Some(3),
        "CatchingUp" => Some(4),
        "PreReplica" => Some(5),
        "Unknown" => Some(6),
        "Initializing" => Some(7),
        _ => None,
    }
}

fn member_endpoints(member: &MemberInfo) -> Option<NodeEndpoints> {
    let ip: IpAddr = member.external_tcp_ip.parse().ok()?;
    Some(NodeEndpoints {
        hostname: member.external_tcp_ip.clone(),
        tcp: Some(SocketAddr::new(ip, member.external_tcp_port)),
        secure_tcp: member.external_secure_tcp_port.map(|p| SocketAddr::new(ip, p)),
    })
}

fn pick_best(mut members: Vec<MemberInfo>, failed: Option<SocketAddr>) -> Option<NodeEndpoints> {
    members.retain(|m| m.is_alive && state_rank(&m.state).is_some());
    members.sort_by_key(|m| {
        let endpoints = member_endpoints(m);
        let is_failed = match (&endpoints, failed) {
            (Some(e), Some(failed)) => e.tcp == Some(failed) || e.secure_tcp == Some(failed),
            _ => false,
        };
        // the node we just lost goes last, masters first
        (is_failed, state_rank(&m.state).unwrap_or(u8::MAX))
    });
    members.iter().find_map(member_endpoints)
}

/// Resolves gossip seeds over DNS and asks them for the cluster state.
pub struct ClusterDiscoverer {
    settings: ClusterSettings,
    http: reqwest::Client,
}

impl ClusterDiscoverer {
    pub fn new(settings: ClusterSettings) -> Self {
        Self { settings, http: reqwest::Client::new() }
    }

    async fn seed_addrs(&self) -> Vec<SocketAddr> {
        let mut seeds = Vec::new();
        if let Some(dns) = &self.settings.dns {
            match lookup_host((dns.as_str(), self.settings.gossip_port)).await {
                Ok(resolved) => seeds.extend(resolved),
                Err(e) => warn!(dns, err = %e, "cluster DNS resolution failed"),
            }
        }
        for seed in &self.settings.seeds {
            match lookup_host((seed.host.as_str(), seed.port)).await {
                Ok(resolved) => seeds.extend(resolved),
                Err(e) => warn!(host = seed.host, err = %e, "gossip seed resolution failed"),
            }
        }
        seeds
    }

    async fn gossip(&self, seed: SocketAddr) -> Option<Vec<MemberInfo>> {
        let url = format!("http://{seed}/gossip");
        let response = self
            .http
            .get(&url)
            .timeout(self.settings.gossip_timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match response {
            Ok(response) => match response.json::<GossipResponse>().await {
                Ok(gossip) => Some(gossip.members),
                Err(e) => {
                    debug!(%seed, err = %e, "malformed gossip response");
                    None
                }
            },
            Err(e) => {
                debug!(%seed, err = %e, "gossip request failed");
                None
            }
        }
    }

    async fn attempt(&self, failed: Option<SocketAddr>) -> Option<NodeEndpoints> {
        for seed in self.seed_addrs().await {
            if let Some(members) = self.gossip(seed).await {
                if let Some(endpoints) = pick_best(members, failed) {
                    return Some(endpoints)
                }
            }
        }
        None
    }
}

#[async_trait]
impl Discover for ClusterDiscoverer {
    async fn discover(&self, failed: Option<SocketAddr>) -> Result<NodeEndpoints, Error> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            if let Some(endpoints) = self.attempt(failed).await {
                debug!(attempts, host = endpoints.hostname, "discovered a node");
                return Ok(endpoints)
            }
            if self.settings.max_discover_attempts >= 0 &&
                attempts >= self.settings.max_discover_attempts
            {
                return Err(Error::CannotEstablishConnection(format!(
                    "failed to discover a candidate in {attempts} attempts"
                )))
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
